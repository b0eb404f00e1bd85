use crate::{copy_to, find_least_utilized, XACT_MIRROR_KIND};
use log::{debug, error, info, warn};
use mountfs::{ContentSpecMgr, Lom, MountedFs, MountpathInfo};
use ostore_lib::{next_xact_id, MirrorConf, StoreResult, Xact, XactDemandBase};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const MPATH_QUEUE_DEPTH: usize = 8;

enum MpathEvent {
    Add(String),
    Remove(String),
}

struct Jogger {
    mpath: Arc<MountpathInfo>,
    tx: mpsc::Sender<Lom>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// n-way local replication: one jogger per available mountpath plus the
/// dispatching front end. A PUT posts its LOM here; the least-utilized
/// mountpath not already holding the object gets the copy.
pub struct XactCopy {
    demand: XactDemandBase,
    mfs: Arc<MountedFs>,
    csm: Arc<ContentSpecMgr>,
    mirror: MirrorConf,
    joggers: Mutex<HashMap<String, Jogger>>,
    mpath_tx: mpsc::Sender<MpathEvent>,
    mpath_rx: Mutex<Option<mpsc::Receiver<MpathEvent>>>,
}

impl mountfs::PathRunner for XactCopy {
    fn req_add_mountpath(&self, mpath: &str) {
        let _ = self.mpath_tx.try_send(MpathEvent::Add(mpath.to_string()));
    }

    fn req_remove_mountpath(&self, mpath: &str) {
        let _ = self.mpath_tx.try_send(MpathEvent::Remove(mpath.to_string()));
    }

    fn req_enable_mountpath(&self, mpath: &str) {
        self.req_add_mountpath(mpath)
    }

    fn req_disable_mountpath(&self, mpath: &str) {
        self.req_remove_mountpath(mpath)
    }
}

impl XactCopy {
    pub fn new(
        bucket: impl Into<String>,
        bck_is_local: bool,
        mirror: MirrorConf,
        mfs: Arc<MountedFs>,
        csm: Arc<ContentSpecMgr>,
    ) -> Arc<Self> {
        let (mpath_tx, mpath_rx) = mpsc::channel(MPATH_QUEUE_DEPTH);
        let xact = Arc::new(Self {
            demand: XactDemandBase::new(next_xact_id(), XACT_MIRROR_KIND, bucket, bck_is_local),
            mfs,
            csm,
            mirror,
            joggers: Mutex::new(HashMap::new()),
            mpath_tx,
            mpath_rx: Mutex::new(Some(mpath_rx)),
        });

        let (available, _) = xact.mfs.get();
        for mp in available.values() {
            xact.add_jogger(mp.clone());
        }
        xact
    }

    pub fn xact(&self) -> &dyn Xact {
        &self.demand
    }

    /// Spawns the xaction's own task: idle-timeout accounting plus mountpath
    /// lifecycle events.
    pub fn run(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut mpath_rx = self
            .mpath_rx
            .lock()
            .unwrap()
            .take()
            .expect("run() may only be called once");
        tokio::spawn(async move {
            info!("starting {}", this.demand.describe());
            let abort = this.demand.abort_token();
            let mut tick = this.demand.idle_ticker();
            loop {
                tokio::select! {
                    _ = abort.cancelled() => {
                        this.stop();
                        return;
                    }
                    _ = tick.tick() => {
                        if this.demand.timeout() {
                            debug!("{}: idle for {:?}, exiting", this.demand.describe(), this.demand.idle_period());
                            this.stop();
                            return;
                        }
                    }
                    event = mpath_rx.recv() => {
                        match event {
                            Some(MpathEvent::Add(mpath)) => this.handle_mpath_add(&mpath),
                            Some(MpathEvent::Remove(mpath)) => this.handle_mpath_remove(&mpath),
                            None => {
                                this.stop();
                                return;
                            }
                        }
                    }
                }
            }
        })
    }

    /// Schedules one more local copy of the object. Not finding a candidate
    /// mountpath is not an error: the PUT simply stays un-mirrored.
    pub fn copy(&self, lom: Lom) -> StoreResult<()> {
        self.demand.renew();
        let joggers = self.joggers.lock().unwrap();
        let dest = find_least_utilized(
            &lom,
            joggers.values().map(|j| &j.mpath),
            &self.mfs,
            &self.csm,
        );
        let Some(dest) = dest else {
            debug!("{}: no eligible mountpath for a copy", lom);
            return Ok(());
        };
        let jogger = joggers.get(&dest.path).expect("destination came from this map");
        self.demand.inc_pending();
        if let Err(e) = jogger.tx.try_send(lom) {
            self.demand.dec_pending();
            warn!(
                "mirror jogger {} is saturated (burst_buffer={}), dropping: {}",
                dest.path, self.mirror.burst_buffer, e
            );
        }
        Ok(())
    }

    pub fn stop(&self) {
        let mut joggers = self.joggers.lock().unwrap();
        for (_, jogger) in joggers.drain() {
            jogger.stop.cancel();
            jogger.task.abort();
        }
        if !self.demand.finished() {
            self.demand.base().set_end_time();
        }
    }

    /// Waits until every queued copy has been worked off; test and shutdown
    /// helper.
    pub async fn drain(&self) {
        while self.demand.pending() > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    fn handle_mpath_add(self: &Arc<Self>, mpath: &str) {
        let (available, _) = self.mfs.get();
        let Some(mp) = available.get(mpath) else {
            warn!("mountpath {} is not available, not adding a jogger", mpath);
            return;
        };
        if self.joggers.lock().unwrap().contains_key(mpath) {
            warn!("attempted to add an already existing mountpath: {}", mpath);
            return;
        }
        self.add_jogger(mp.clone());
    }

    fn handle_mpath_remove(&self, mpath: &str) {
        let mut joggers = self.joggers.lock().unwrap();
        if let Some(jogger) = joggers.remove(mpath) {
            jogger.stop.cancel();
        }
    }

    fn add_jogger(self: &Arc<Self>, mp: Arc<MountpathInfo>) {
        let (tx, mut rx) = mpsc::channel::<Lom>(self.mirror.burst_buffer);
        let stop = CancellationToken::new();
        let this = self.clone();
        let dest = mp.clone();
        let stop_rx = stop.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop_rx.cancelled() => return,
                    lom = rx.recv() => {
                        let Some(mut lom) = lom else { return };
                        match copy_to(&mut lom, &dest, &this.csm).await {
                            Ok(copy_fqn) => debug!("{}: copied to {}", lom, copy_fqn),
                            Err(e) => {
                                error!("{}: copy to {} failed: {}", lom, dest.path, e);
                                this.mfs.report_io_error(&lom.fqn, &e);
                            }
                        }
                        this.demand.dec_pending();
                    }
                }
            }
        });
        self.joggers.lock().unwrap().insert(
            mp.path.clone(),
            Jogger {
                mpath: mp,
                tx,
                stop,
                task,
            },
        );
    }
}
