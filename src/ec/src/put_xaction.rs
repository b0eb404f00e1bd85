use crate::put_jogger::PutJogger;
use crate::{
    ControlMsg, EcAction, EcRequest, MpathEvent, ReqBase, XactEcBase, REQUEST_BUF_SIZE_GLOBAL,
    XACT_EC_PUT_KIND,
};
use log::{debug, error, info, warn};
use ostore_lib::{next_xact_id, EcConf, SmapOwner, Snode, StoreResult, Xact};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use transport::{SliceRegistry, StreamBundle};

/// Erasure-coding runner for PUT and delete: accepts requests and
/// dispatches each to the jogger owning the primary's mountpath.
pub struct XactPut {
    pub base: XactEcBase,
    pub req: ReqBase,
    pub ec_conf: EcConf,
    joggers: Mutex<HashMap<String, PutJogger>>,
    stats_time: Duration,
}

impl mountfs::PathRunner for XactPut {
    fn req_add_mountpath(&self, mpath: &str) {
        self.req.req_add_mountpath(mpath)
    }

    fn req_remove_mountpath(&self, mpath: &str) {
        self.req.req_remove_mountpath(mpath)
    }

    fn req_enable_mountpath(&self, _mpath: &str) {}

    fn req_disable_mountpath(&self, _mpath: &str) {}
}

impl XactPut {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bck_name: &str,
        ec_conf: EcConf,
        smap: Arc<SmapOwner>,
        si: Snode,
        csm: Arc<mountfs::ContentSpecMgr>,
        slices: Arc<SliceRegistry>,
        req_bundle: Arc<StreamBundle>,
        resp_bundle: Arc<StreamBundle>,
        send_file_timeout: Duration,
        stats_time: Duration,
    ) -> Arc<Self> {
        let base = XactEcBase::new(
            next_xact_id(),
            XACT_EC_PUT_KIND,
            bck_name.to_string(),
            smap,
            si,
            csm,
            slices,
            req_bundle,
            resp_bundle,
            send_file_timeout,
        );
        let xact = Arc::new(Self {
            base,
            req: ReqBase::new(REQUEST_BUF_SIZE_GLOBAL),
            ec_conf,
            joggers: Mutex::new(HashMap::new()),
            stats_time,
        });

        // create a jogger per known mountpath, available and disabled alike
        let (available, disabled) = xact.base.csm.mfs().get();
        for mpath in available.keys().chain(disabled.keys()) {
            xact.add_jogger(mpath);
        }
        xact
    }

    pub fn xact(&self) -> &dyn Xact {
        &self.base.demand
    }

    /// Schedules the object for erasure coding.
    pub async fn encode(&self, mut req: EcRequest) {
        req.enqueued_at = Some(Instant::now());
        debug!(
            "ec put[{}]: encode object {}",
            self.base.bck_name,
            req.lom.uname()
        );
        self.dispatch_inbound(req).await;
    }

    /// Deletes all object slices and copies after the main object is
    /// removed.
    pub async fn cleanup(&self, mut req: EcRequest) {
        req.enqueued_at = Some(Instant::now());
        self.dispatch_inbound(req).await;
    }

    async fn dispatch_inbound(&self, req: EcRequest) {
        if !self.req.requests_enabled() {
            self.req.fail_request(
                req,
                &format!("EC on bucket {} is disabled, no EC requests accepted", self.base.bck_name),
            );
            return;
        }
        if self.req.ec_tx.send(req).await.is_err() {
            warn!("ec put[{}]: request channel is closed", self.base.bck_name);
        }
    }

    /// The xaction's main loop; owns the request, control, and mountpath
    /// channels.
    pub fn run(self: &Arc<Self>) -> JoinHandle<StoreResult<()>> {
        let this = self.clone();
        let mut ec_rx = this.req.ec_rx.lock().unwrap().take().expect("run() called once");
        let mut mpath_rx = this.req.mpath_rx.lock().unwrap().take().expect("run() called once");
        let mut control_rx = this.req.control_rx.lock().unwrap().take().expect("run() called once");

        tokio::spawn(async move {
            info!("starting {}", this.base.demand.describe());
            let abort = this.base.demand.abort_token();
            let mut idle_tick = this.base.demand.idle_ticker();
            let mut stats_tick = tokio::time::interval(this.stats_time);
            stats_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut last_action = Instant::now();
            let idle_timeout = this.base.demand.idle_period();

            loop {
                tokio::select! {
                    _ = stats_tick.tick() => {
                        info!("{}", this.base.stats.describe(&this.base.bck_name));
                    }
                    req = ec_rx.recv() => {
                        let Some(mut req) = req else {
                            this.stop();
                            return Ok(());
                        };
                        last_action = Instant::now();
                        match req.action {
                            EcAction::Split => {
                                this.base.stats.encode_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                                this.base.stats.encode_bytes.fetch_add(req.lom.size.max(0) as u64, std::sync::atomic::Ordering::Relaxed);
                            }
                            EcAction::Delete => {
                                this.base.stats.delete_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                            }
                            EcAction::Restore => {
                                error!("invalid request action for the put xaction");
                                req.resolve(Err(ostore_lib::StoreError::InvalidParam(
                                    "restore routed to the put xaction".to_string(),
                                )));
                                continue;
                            }
                        }
                        this.dispatch_request(req);
                    }
                    event = mpath_rx.recv() => {
                        match event {
                            Some(MpathEvent::Add(mpath)) => this.handle_mpath_add(&mpath),
                            Some(MpathEvent::Remove(mpath)) => this.handle_mpath_remove(&mpath),
                            None => { this.stop(); return Ok(()); }
                        }
                    }
                    _ = idle_tick.tick() => {
                        if last_action.elapsed() >= idle_timeout && this.base.demand.timeout() {
                            debug!("{}: idle time is over", this.base.demand.describe());
                            this.stop();
                            return Ok(());
                        }
                    }
                    msg = control_rx.recv() => {
                        match msg {
                            Some(ControlMsg::EnableRequests) => this.req.set_requests_enabled(),
                            Some(ControlMsg::ClearRequests) => {
                                this.req.set_requests_disabled();
                                // drain pending requests, returning each with an error
                                while let Ok(req) = ec_rx.try_recv() {
                                    this.req.fail_request(
                                        req,
                                        &format!("EC disabled, can't proceed with the request on bucket {}", this.base.bck_name),
                                    );
                                }
                                this.stop();
                                return Ok(());
                            }
                            None => { this.stop(); return Ok(()); }
                        }
                    }
                    _ = abort.cancelled() => {
                        this.stop();
                        return Err(ostore_lib::StoreError::Aborted(format!(
                            "{} aborted, exiting", this.base.demand.describe()
                        )));
                    }
                }
            }
        })
    }

    fn dispatch_request(self: &Arc<Self>, req: EcRequest) {
        if !self.req.requests_enabled() {
            self.req.fail_request(
                req,
                &format!("EC on bucket {} is being disabled, no EC requests accepted", self.base.bck_name),
            );
            return;
        }
        let key = crate::jogger_key(&req);
        self.base.demand.inc_pending();
        let joggers = self.joggers.lock().unwrap();
        let Some(jogger) = joggers.get(&key) else {
            self.base.demand.dec_pending();
            error!("invalid mountpath {} in EC request", key);
            self.req.fail_request(req, "invalid mountpath in EC request");
            return;
        };
        debug!(
            "ec put[{}]: dispatching {} to {}",
            self.base.bck_name,
            req.lom.uname(),
            key
        );
        jogger.post(req, &self.base.demand);
    }

    pub fn stop(&self) {
        if self.base.demand.finished() {
            warn!("{} - not running, nothing to do", self.base.demand.describe());
            return;
        }
        let mut joggers = self.joggers.lock().unwrap();
        for (_, jogger) in joggers.drain() {
            jogger.stop();
        }
        // the bundles stay open: they are shared between the EC xactions
        self.base.demand.base().set_end_time();
    }

    fn add_jogger(self: &Arc<Self>, mpath: &str) {
        let mut joggers = self.joggers.lock().unwrap();
        if joggers.contains_key(mpath) {
            warn!("attempted to add already existing mountpath: {}", mpath);
            return;
        }
        joggers.insert(mpath.to_string(), PutJogger::spawn(self.clone(), mpath));
    }

    fn handle_mpath_add(self: &Arc<Self>, mpath: &str) {
        self.add_jogger(mpath);
    }

    fn handle_mpath_remove(&self, mpath: &str) {
        let mut joggers = self.joggers.lock().unwrap();
        match joggers.remove(mpath) {
            Some(jogger) => jogger.stop(),
            None => error!("EC mountpath remove called with unknown mountpath {}", mpath),
        }
    }
}
