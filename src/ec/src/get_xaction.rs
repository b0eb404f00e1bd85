use crate::get_jogger::GetJogger;
use crate::{
    ControlMsg, EcAction, EcMetadata, EcRequest, IntraReq, MpathEvent, ReqBase, XactEcBase,
    REQUEST_BUF_SIZE_GLOBAL, XACT_EC_GET_KIND,
};
use dashmap::DashMap;
use log::{debug, error, info, warn};
use ostore_lib::{next_xact_id, EcConf, SmapOwner, Snode, StoreError, StoreResult, Xact};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use transport::{BodyReader, ObjectAttrs, SliceRegistry, StreamBundle};

/// Erasure-coding restore runner: requests are dispatched to the jogger of
/// the mountpath where the restored object will land; the jogger collects
/// slices or a replica from the peers and rebuilds the object.
pub struct XactGet {
    pub base: XactEcBase,
    pub req: ReqBase,
    pub ec_conf: EcConf,
    joggers: Mutex<HashMap<String, GetJogger>>,
    /// Slice metadata stashed per pending-writer key while responses are in
    /// flight.
    pub resp_meta: DashMap<String, EcMetadata>,
}

impl mountfs::PathRunner for XactGet {
    fn req_add_mountpath(&self, mpath: &str) {
        self.req.req_add_mountpath(mpath)
    }

    fn req_remove_mountpath(&self, mpath: &str) {
        self.req.req_remove_mountpath(mpath)
    }

    fn req_enable_mountpath(&self, _mpath: &str) {}

    fn req_disable_mountpath(&self, _mpath: &str) {}
}

impl XactGet {
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
    ) -> Arc<Self> {
        let base = XactEcBase::new(
            next_xact_id(),
            XACT_EC_GET_KIND,
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
            resp_meta: DashMap::new(),
        });

        let (available, disabled) = xact.base.csm.mfs().get();
        for mpath in available.keys().chain(disabled.keys()) {
            xact.add_jogger(mpath);
        }
        xact
    }

    pub fn xact(&self) -> &dyn Xact {
        &self.base.demand
    }

    /// Schedules an object restore; the caller waits on the request's reply
    /// channel.
    pub async fn decode(&self, mut req: EcRequest) {
        req.enqueued_at = Some(Instant::now());
        if !self.req.requests_enabled() {
            self.req.fail_request(
                req,
                &format!("EC on bucket {} is disabled, no EC requests accepted", self.base.bck_name),
            );
            return;
        }
        if self.req.ec_tx.send(req).await.is_err() {
            warn!("ec get[{}]: request channel is closed", self.base.bck_name);
        }
    }

    /// Routes a peer's reply into the matching pending writer; a reply
    /// nobody waits for anymore is drained and dropped.
    pub async fn dispatch_resp(
        &self,
        ireq: IntraReq,
        bucket: &str,
        objname: &str,
        attrs: ObjectAttrs,
        body: BodyReader,
    ) {
        let key = self
            .base
            .writer_key(&ireq.sender, &ostore_lib::uname(bucket, objname));
        let Some(writer) = self.base.slices.get(&key) else {
            debug!("no pending writer for {}, dropping late response", key);
            let _ = transport::drain_body(body).await;
            return;
        };
        if let Some(meta) = &ireq.meta {
            self.resp_meta.insert(key.clone(), meta.clone());
        }
        if let Err(e) = self
            .base
            .slices
            .writer_receive(&writer, ireq.exists, &attrs, body)
            .await
        {
            if !e.is_not_found() {
                warn!("receive into {} failed: {}", key, e);
            }
        }
    }

    pub fn run(self: &Arc<Self>) -> JoinHandle<StoreResult<()>> {
        let this = self.clone();
        let mut ec_rx = this.req.ec_rx.lock().unwrap().take().expect("run() called once");
        let mut mpath_rx = this.req.mpath_rx.lock().unwrap().take().expect("run() called once");
        let mut control_rx = this.req.control_rx.lock().unwrap().take().expect("run() called once");

        tokio::spawn(async move {
            info!("starting {}", this.base.demand.describe());
            let abort = this.base.demand.abort_token();
            let mut idle_tick = this.base.demand.idle_ticker();
            let mut last_action = Instant::now();
            let idle_timeout = this.base.demand.idle_period();

            loop {
                tokio::select! {
                    req = ec_rx.recv() => {
                        let Some(mut req) = req else {
                            this.stop();
                            return Ok(());
                        };
                        last_action = Instant::now();
                        if req.action != EcAction::Restore {
                            error!("invalid request action for the get xaction");
                            req.resolve(Err(StoreError::InvalidParam(
                                "only restore is served by the get xaction".to_string(),
                            )));
                            continue;
                        }
                        this.dispatch_request(req);
                    }
                    event = mpath_rx.recv() => {
                        match event {
                            Some(MpathEvent::Add(mpath)) => this.add_jogger(&mpath),
                            Some(MpathEvent::Remove(mpath)) => this.remove_jogger(&mpath),
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
                        return Err(StoreError::Aborted(format!(
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
        self.base.stats.decode_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let key = crate::jogger_key(&req);
        self.base.demand.inc_pending();
        let joggers = self.joggers.lock().unwrap();
        let Some(jogger) = joggers.get(&key) else {
            self.base.demand.dec_pending();
            error!("invalid mountpath {} in EC request", key);
            self.req.fail_request(req, "invalid mountpath in EC request");
            return;
        };
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
        self.base.demand.base().set_end_time();
    }

    fn add_jogger(self: &Arc<Self>, mpath: &str) {
        let mut joggers = self.joggers.lock().unwrap();
        if joggers.contains_key(mpath) {
            warn!("attempted to add already existing mountpath: {}", mpath);
            return;
        }
        joggers.insert(mpath.to_string(), GetJogger::spawn(self.clone(), mpath));
    }

    fn remove_jogger(&self, mpath: &str) {
        let mut joggers = self.joggers.lock().unwrap();
        match joggers.remove(mpath) {
            Some(jogger) => jogger.stop(),
            None => error!("EC mountpath remove called with unknown mountpath {}", mpath),
        }
    }
}
