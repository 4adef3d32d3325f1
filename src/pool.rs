//! Bounded pool of rendering-engine instances and the page sessions carved
//! from them.
//!
//! All bookkeeping (instance list, per-instance lease counts, health flags)
//! lives behind one async mutex. Engine I/O (launch, open, close) happens
//! outside the lock against slots reserved while holding it, so a slow
//! Chromium start never blocks releases or maintenance.

use crate::engine::{EngineLauncher, Navigation, PageSession, RenderEngine, WaitPolicy};
use crate::error::ScrapeError;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_instances: usize,
    pub contexts_per_instance: usize,
    pub acquire_timeout: Duration,
}

impl PoolConfig {
    pub fn from_config(cfg: &crate::config::Scraper) -> Self {
        Self {
            max_instances: cfg.max_instances,
            contexts_per_instance: cfg.contexts_per_instance,
            acquire_timeout: cfg.acquire_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstanceState {
    Starting,
    Idle,
    InUse,
    Unhealthy,
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub instances: usize,
    /// Instances with at least one session handed out.
    pub active_instances: usize,
    /// Live sessions, leased plus parked.
    pub contexts: usize,
    pub leased_contexts: usize,
}

struct Instance {
    id: u64,
    engine: Option<Arc<dyn RenderEngine>>,
    state: InstanceState,
    leased: usize,
    parked: Vec<Box<dyn PageSession>>,
    last_handout: Instant,
}

impl Instance {
    fn starting(id: u64, leased: usize) -> Self {
        Self {
            id,
            engine: None,
            state: InstanceState::Starting,
            leased,
            parked: Vec::new(),
            last_handout: Instant::now(),
        }
    }

    fn live_contexts(&self) -> usize {
        self.leased + self.parked.len()
    }

    fn engine_alive(&self) -> bool {
        self.engine.as_ref().map(|e| e.is_alive()).unwrap_or(false)
    }

    fn usable(&self) -> bool {
        matches!(self.state, InstanceState::Idle | InstanceState::InUse) && self.engine_alive()
    }

    fn refresh_state(&mut self) {
        if self.engine.is_some() && !self.engine_alive() {
            self.state = InstanceState::Unhealthy;
        } else if matches!(self.state, InstanceState::Idle | InstanceState::InUse) {
            self.state = if self.leased > 0 {
                InstanceState::InUse
            } else {
                InstanceState::Idle
            };
        }
    }

    fn hand_out(&mut self) {
        self.leased += 1;
        self.last_handout = Instant::now();
        self.state = InstanceState::InUse;
    }
}

#[derive(Default)]
struct PoolState {
    instances: Vec<Instance>,
    next_id: u64,
    closed: bool,
}

impl PoolState {
    fn reserve_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn find_mut(&mut self, id: u64) -> Option<&mut Instance> {
        self.instances.iter_mut().find(|i| i.id == id)
    }
}

enum Plan {
    Reuse(u64, Box<dyn PageSession>),
    Open(u64, Arc<dyn RenderEngine>),
    Launch(u64),
    Wait,
}

/// A session leased from the pool. Hand it back with [`ResourcePool::release`];
/// dropping it instead discards the session.
pub struct PooledContext {
    pool: Weak<ResourcePool>,
    instance_id: u64,
    lease_id: Uuid,
    session: Box<dyn PageSession>,
    returned: bool,
}

impl PooledContext {
    pub fn lease_id(&self) -> Uuid {
        self.lease_id
    }

    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    pub fn session(&self) -> &dyn PageSession {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> &mut dyn PageSession {
        self.session.as_mut()
    }

    /// Takes the real session out, leaving a dead stand-in for `Drop` to skip.
    fn take_session(&mut self) -> Option<Box<dyn PageSession>> {
        if self.returned {
            return None;
        }
        self.returned = true;
        Some(std::mem::replace(&mut self.session, Box::new(Returned)))
    }
}

/// Placeholder left in a context whose session went back to the pool.
struct Returned;

#[async_trait::async_trait]
impl PageSession for Returned {
    async fn navigate(
        &mut self,
        url: &str,
        _wait: WaitPolicy,
        _timeout: Duration,
    ) -> anyhow::Result<Navigation> {
        anyhow::bail!("session already returned to the pool; cannot open {url}")
    }

    async fn query_text(&self, _selector: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    async fn query_html(&self, _selector: &str) -> anyhow::Result<Option<String>> {
        Ok(None)
    }

    fn is_alive(&self) -> bool {
        false
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        Ok(())
    }
}

impl Drop for PooledContext {
    fn drop(&mut self) {
        let Some(session) = self.take_session() else {
            return;
        };
        let instance_id = self.instance_id;
        match (self.pool.upgrade(), tokio::runtime::Handle::try_current()) {
            (Some(pool), Ok(handle)) => {
                handle.spawn(async move {
                    pool.return_session(instance_id, session, false).await;
                });
            }
            _ => debug!(instance_id, "context dropped outside runtime; slot not reclaimed"),
        }
    }
}

pub struct ResourcePool {
    launcher: Arc<dyn EngineLauncher>,
    cfg: PoolConfig,
    state: Mutex<PoolState>,
    released: Notify,
}

impl ResourcePool {
    pub fn new(launcher: Arc<dyn EngineLauncher>, cfg: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            launcher,
            cfg,
            state: Mutex::new(PoolState::default()),
            released: Notify::new(),
        })
    }

    pub fn config(&self) -> PoolConfig {
        self.cfg
    }

    /// Start `count` instances ahead of demand (capped at `max_instances`).
    pub async fn warm_up(&self, count: usize) -> anyhow::Result<()> {
        let ids: Vec<u64> = {
            let mut st = self.state.lock().await;
            let room = self.cfg.max_instances.saturating_sub(st.instances.len());
            (0..count.min(room))
                .map(|_| {
                    let id = st.reserve_id();
                    st.instances.push(Instance::starting(id, 0));
                    id
                })
                .collect()
        };
        for id in ids {
            self.fill_starting(id).await?;
        }
        Ok(())
    }

    /// Lease a session using the configured acquire timeout.
    pub async fn acquire_default(self: &Arc<Self>) -> Result<PooledContext, ScrapeError> {
        self.acquire(self.cfg.acquire_timeout).await
    }

    /// Lease a session, starting an instance if there is room, otherwise
    /// waiting up to `timeout` for one to be released.
    #[instrument(skip_all)]
    pub async fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<PooledContext, ScrapeError> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let (plan, stale) = {
                let mut guard = self.state.lock().await;
                if guard.closed {
                    return Err(ScrapeError::Engine("pool is shut down".into()));
                }
                self.plan(&mut guard)
            };
            for session in stale {
                let _ = session.close().await;
            }

            match plan {
                Plan::Reuse(instance_id, session) => {
                    return Ok(self.lease(instance_id, session));
                }
                Plan::Open(instance_id, engine) => match engine.open_session().await {
                    Ok(session) => return Ok(self.lease(instance_id, session)),
                    Err(err) => {
                        self.abandon_slot(instance_id).await;
                        return Err(ScrapeError::Engine(format!("{err:#}")));
                    }
                },
                Plan::Launch(instance_id) => return self.launch_and_lease(instance_id).await,
                Plan::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        warn!(timeout_ms = timeout.as_millis() as u64, "pool exhausted");
                        return Err(ScrapeError::PoolExhausted(timeout));
                    }
                }
            }
        }
    }

    fn plan(&self, guard: &mut PoolState) -> (Plan, Vec<Box<dyn PageSession>>) {
        let mut stale = Vec::new();

        for inst in guard.instances.iter_mut().filter(|i| i.usable()) {
            while let Some(session) = inst.parked.pop() {
                if session.is_alive() {
                    inst.hand_out();
                    return (Plan::Reuse(inst.id, session), stale);
                }
                stale.push(session);
            }
        }

        let cap = self.cfg.contexts_per_instance;
        if let Some(inst) = guard
            .instances
            .iter_mut()
            .filter(|i| i.usable() && i.live_contexts() < cap)
            .min_by_key(|i| i.live_contexts())
        {
            if let Some(engine) = inst.engine.clone() {
                inst.hand_out();
                return (Plan::Open(inst.id, engine), stale);
            }
        }

        if guard.instances.len() < self.cfg.max_instances {
            let id = guard.reserve_id();
            guard.instances.push(Instance::starting(id, 1));
            return (Plan::Launch(id), stale);
        }

        (Plan::Wait, stale)
    }

    fn lease(self: &Arc<Self>, instance_id: u64, session: Box<dyn PageSession>) -> PooledContext {
        let lease_id = Uuid::new_v4();
        debug!(instance_id, %lease_id, "context leased");
        PooledContext {
            pool: Arc::downgrade(self),
            instance_id,
            lease_id,
            session,
            returned: false,
        }
    }

    async fn launch_and_lease(
        self: &Arc<Self>,
        instance_id: u64,
    ) -> Result<PooledContext, ScrapeError> {
        let engine = match self.launcher.launch().await {
            Ok(engine) => engine,
            Err(err) => {
                self.drop_instance(instance_id).await;
                return Err(ScrapeError::Engine(format!("{err:#}")));
            }
        };
        info!(instance_id, "engine instance started");

        let opened = engine.open_session().await;
        {
            let mut guard = self.state.lock().await;
            let closed = guard.closed;
            let Some(inst) = guard.find_mut(instance_id) else {
                drop(guard);
                let _ = engine.close().await;
                return Err(ScrapeError::Engine("instance removed while starting".into()));
            };
            inst.engine = Some(Arc::clone(&engine));
            inst.last_handout = Instant::now();
            inst.state = InstanceState::Idle;
            if opened.is_err() || closed {
                inst.leased = inst.leased.saturating_sub(1);
            }
            inst.refresh_state();
        }

        // The new instance has free slots beyond this caller's; let every
        // waiter re-plan.
        self.released.notify_waiters();
        match opened {
            Ok(session) => Ok(self.lease(instance_id, session)),
            Err(err) => Err(ScrapeError::Engine(format!("{err:#}"))),
        }
    }

    async fn fill_starting(&self, instance_id: u64) -> anyhow::Result<()> {
        match self.launcher.launch().await {
            Ok(engine) => {
                let mut guard = self.state.lock().await;
                if let Some(inst) = guard.find_mut(instance_id) {
                    inst.engine = Some(engine);
                    inst.state = InstanceState::Idle;
                    inst.last_handout = Instant::now();
                    inst.refresh_state();
                } else {
                    drop(guard);
                    let _ = engine.close().await;
                }
                self.released.notify_waiters();
                info!(instance_id, "engine instance started");
                Ok(())
            }
            Err(err) => {
                self.drop_instance(instance_id).await;
                Err(err)
            }
        }
    }

    async fn abandon_slot(&self, instance_id: u64) {
        {
            let mut guard = self.state.lock().await;
            if let Some(inst) = guard.find_mut(instance_id) {
                inst.leased = inst.leased.saturating_sub(1);
                inst.refresh_state();
            }
        }
        self.released.notify_one();
    }

    async fn drop_instance(&self, instance_id: u64) {
        {
            let mut guard = self.state.lock().await;
            guard.instances.retain(|i| i.id != instance_id);
        }
        self.released.notify_one();
    }

    /// Return a leased session. Healthy sessions are parked for reuse; an
    /// unhealthy one is closed.
    pub async fn release(&self, mut ctx: PooledContext, healthy: bool) {
        if let Some(session) = ctx.take_session() {
            self.return_session(ctx.instance_id, session, healthy).await;
        }
    }

    async fn return_session(&self, instance_id: u64, session: Box<dyn PageSession>, healthy: bool) {
        let to_close = {
            let mut guard = self.state.lock().await;
            let st = &mut *guard;
            let closed = st.closed;
            match st.find_mut(instance_id) {
                Some(inst) => {
                    inst.leased = inst.leased.saturating_sub(1);
                    inst.refresh_state();
                    if healthy && !closed && inst.usable() && session.is_alive() {
                        inst.parked.push(session);
                        None
                    } else {
                        Some(session)
                    }
                }
                None => Some(session),
            }
        };
        self.released.notify_one();
        if let Some(session) = to_close {
            debug!(instance_id, "closing returned context");
            let _ = session.close().await;
        }
    }

    /// Close instances whose last hand-out is older than `max_idle`, always
    /// retaining at least one instance.
    #[instrument(skip_all)]
    pub async fn evict_idle(&self, max_idle: Duration) -> usize {
        let victims = {
            let mut guard = self.state.lock().await;
            let now = Instant::now();
            let mut victims = Vec::new();
            while guard.instances.len() > 1 {
                let pos = guard.instances.iter().position(|i| {
                    i.state == InstanceState::Idle
                        && i.leased == 0
                        && now.duration_since(i.last_handout) > max_idle
                });
                match pos {
                    Some(p) => {
                        let mut inst = guard.instances.remove(p);
                        inst.state = InstanceState::Closed;
                        victims.push(inst);
                    }
                    None => break,
                }
            }
            victims
        };
        let evicted = victims.len();
        for inst in victims {
            info!(instance_id = inst.id, "closing idle engine instance");
            close_instance(inst).await;
        }
        if evicted > 0 {
            self.released.notify_one();
        }
        evicted
    }

    /// Remove disconnected instances and start replacements one-for-one up to
    /// `max_instances`.
    #[instrument(skip_all)]
    pub async fn reap_unhealthy(&self) -> usize {
        let (dead, replacements) = {
            let mut guard = self.state.lock().await;
            let mut dead = Vec::new();
            let mut i = 0;
            while i < guard.instances.len() {
                let inst = &mut guard.instances[i];
                inst.refresh_state();
                if inst.state == InstanceState::Unhealthy {
                    let mut inst = guard.instances.remove(i);
                    inst.state = InstanceState::Closed;
                    dead.push(inst);
                } else {
                    i += 1;
                }
            }
            let room = self.cfg.max_instances.saturating_sub(guard.instances.len());
            let replacements: Vec<u64> = if guard.closed {
                Vec::new()
            } else {
                (0..dead.len().min(room))
                    .map(|_| {
                        let id = guard.reserve_id();
                        guard.instances.push(Instance::starting(id, 0));
                        id
                    })
                    .collect()
            };
            (dead, replacements)
        };

        let reaped = dead.len();
        for inst in dead {
            warn!(instance_id = inst.id, "removing unhealthy engine instance");
            close_instance(inst).await;
        }
        for id in replacements {
            if let Err(err) = self.fill_starting(id).await {
                warn!(?err, "failed to start replacement engine instance");
            }
        }
        reaped
    }

    pub async fn stats(&self) -> PoolStats {
        let guard = self.state.lock().await;
        let mut stats = PoolStats {
            instances: guard.instances.len(),
            ..Default::default()
        };
        for inst in &guard.instances {
            if inst.state == InstanceState::InUse {
                stats.active_instances += 1;
            }
            stats.contexts += inst.live_contexts();
            stats.leased_contexts += inst.leased;
        }
        stats
    }

    /// Close every instance and refuse further acquisitions.
    pub async fn shutdown(&self) {
        let instances = {
            let mut guard = self.state.lock().await;
            guard.closed = true;
            std::mem::take(&mut guard.instances)
        };
        self.released.notify_waiters();
        let count = instances.len();
        for inst in instances {
            close_instance(inst).await;
        }
        info!(instances = count, "resource pool shut down");
    }
}

async fn close_instance(mut inst: Instance) {
    for session in inst.parked.drain(..) {
        let _ = session.close().await;
    }
    if let Some(engine) = inst.engine.take() {
        if let Err(err) = engine.close().await {
            debug!(?err, instance_id = inst.id, "engine close failed");
        }
    }
}

/// Periodic idle eviction and health reaping until shutdown is signalled.
pub fn spawn_maintenance(
    pool: Arc<ResourcePool>,
    every: Duration,
    max_idle: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(every_secs = every.as_secs(), "pool maintenance started");
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("pool maintenance stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let evicted = pool.evict_idle(max_idle).await;
                    let reaped = pool.reap_unhealthy().await;
                    let stats = pool.stats().await;
                    debug!(
                        evicted,
                        reaped,
                        instances = stats.instances,
                        active_instances = stats.active_instances,
                        contexts = stats.contexts,
                        "pool maintenance cycle"
                    );
                }
            }
        }
    })
}
