use log::info;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::{interval, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Default idle period after which a demand xaction self-terminates.
pub const XACT_IDLE_TIMEOUT: Duration = Duration::from_secs(3 * 60);

static NEXT_XACT_ID: AtomicI64 = AtomicI64::new(1);

pub fn next_xact_id() -> i64 {
    NEXT_XACT_ID.fetch_add(1, Ordering::Relaxed)
}

fn unix_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// A long-running unit of work that is enumerable, describable, and
/// stoppable.
pub trait Xact: Send + Sync {
    fn id(&self) -> i64;
    fn kind(&self) -> &str;
    fn bucket(&self) -> &str;
    /// Unix nanoseconds; 0 means not started.
    fn start_time(&self) -> i64;
    /// Unix nanoseconds; 0 means still running.
    fn end_time(&self) -> i64;
    fn finished(&self) -> bool;
    fn abort(&self);
    fn aborted(&self) -> bool;
    /// Token that is cancelled exactly once on abort.
    fn abort_token(&self) -> CancellationToken;
    fn describe(&self) -> String;
}

pub struct XactBase {
    id: i64,
    kind: &'static str,
    bucket: String,
    bck_is_local: bool,
    sutime: AtomicI64,
    eutime: AtomicI64,
    abort_flag: AtomicBool,
    token: CancellationToken,
}

impl XactBase {
    pub fn new(id: i64, kind: &'static str) -> Self {
        Self {
            id,
            kind,
            bucket: String::new(),
            bck_is_local: true,
            sutime: AtomicI64::new(unix_nanos()),
            eutime: AtomicI64::new(0),
            abort_flag: AtomicBool::new(false),
            token: CancellationToken::new(),
        }
    }

    pub fn with_bucket(id: i64, kind: &'static str, bucket: impl Into<String>, bck_is_local: bool) -> Self {
        let mut base = Self::new(id, kind);
        base.bucket = bucket.into();
        base.bck_is_local = bck_is_local;
        base
    }

    pub fn bck_is_local(&self) -> bool {
        self.bck_is_local
    }

    /// Marks the xaction finished; idempotent.
    pub fn set_end_time(&self) {
        let _ = self
            .eutime
            .compare_exchange(0, unix_nanos(), Ordering::SeqCst, Ordering::SeqCst);
        info!("{}", self.describe());
    }
}

impl Xact for XactBase {
    fn id(&self) -> i64 {
        self.id
    }

    fn kind(&self) -> &str {
        self.kind
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }

    fn start_time(&self) -> i64 {
        self.sutime.load(Ordering::SeqCst)
    }

    fn end_time(&self) -> i64 {
        self.eutime.load(Ordering::SeqCst)
    }

    fn finished(&self) -> bool {
        self.eutime.load(Ordering::SeqCst) != 0
    }

    fn abort(&self) {
        if self
            .abort_flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("already aborted: {}", self.describe());
            return;
        }
        self.set_end_time();
        self.token.cancel();
        info!("ABORT: {}", self.describe());
    }

    fn aborted(&self) -> bool {
        self.abort_flag.load(Ordering::SeqCst)
    }

    fn abort_token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn describe(&self) -> String {
        let started = self.start_time() / 1_000_000_000;
        let ended = self.end_time();
        if ended == 0 {
            format!("{}:{} started {}", self.kind, self.id, started)
        } else {
            let dur_ms = (ended - self.start_time()) / 1_000_000;
            format!(
                "{}:{} started {} ended {} ({}ms)",
                self.kind,
                self.id,
                started,
                ended / 1_000_000_000,
                dur_ms
            )
        }
    }
}

/// A demand xaction self-terminates after staying idle for one full period,
/// unless it was renewed or still has pending work.
pub struct XactDemandBase {
    base: XactBase,
    renew: AtomicI64,
    pending: AtomicI64,
    idle: Duration,
}

impl XactDemandBase {
    pub fn new(id: i64, kind: &'static str, bucket: impl Into<String>, bck_is_local: bool) -> Self {
        Self::with_idle(id, kind, bucket, bck_is_local, XACT_IDLE_TIMEOUT)
    }

    pub fn with_idle(
        id: i64,
        kind: &'static str,
        bucket: impl Into<String>,
        bck_is_local: bool,
        idle: Duration,
    ) -> Self {
        Self {
            base: XactBase::with_bucket(id, kind, bucket, bck_is_local),
            renew: AtomicI64::new(0),
            pending: AtomicI64::new(0),
            idle,
        }
    }

    pub fn base(&self) -> &XactBase {
        &self.base
    }

    pub fn idle_period(&self) -> Duration {
        self.idle
    }

    /// The xaction's run loop owns this ticker and checks `timeout()` on
    /// every tick.
    pub fn idle_ticker(&self) -> Interval {
        let mut tick = interval(self.idle);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // interval fires immediately by default; skip that first tick
        tick.reset();
        tick
    }

    pub fn renew(&self) {
        self.renew.store(1, Ordering::SeqCst);
    }

    pub fn inc_pending(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_pending(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::SeqCst)
    }

    /// True when the idle tick found no pending work and no renewal since
    /// the previous check.
    pub fn timeout(&self) -> bool {
        if self.pending.load(Ordering::SeqCst) > 0 {
            return false;
        }
        self.renew.fetch_sub(1, Ordering::SeqCst) - 1 < 0
    }
}

impl Xact for XactDemandBase {
    fn id(&self) -> i64 {
        self.base.id()
    }

    fn kind(&self) -> &str {
        self.base.kind()
    }

    fn bucket(&self) -> &str {
        self.base.bucket()
    }

    fn start_time(&self) -> i64 {
        self.base.start_time()
    }

    fn end_time(&self) -> i64 {
        self.base.end_time()
    }

    fn finished(&self) -> bool {
        self.base.finished()
    }

    fn abort(&self) {
        self.base.abort()
    }

    fn aborted(&self) -> bool {
        self.base.aborted()
    }

    fn abort_token(&self) -> CancellationToken {
        self.base.abort_token()
    }

    fn describe(&self) -> String {
        self.base.describe()
    }
}
