use std::collections::HashMap;

use chrono::{DateTime, Utc};
use moka::sync::Cache;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use serde::Serialize;
use snafu::{GenerateImplicitData, Location};
use strum::Display;
use tracing::{info, warn};

use crate::{
    config::{AuthCredential, AuthStatus, POLYGATE_CONFIG},
    error::PolygateError,
};

const SWEEP_INTERVAL_SECS: u64 = 300;

/// Why a credential was put on cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CooldownReason {
    Transient,
    AuthRejected,
    Quota,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CooldownKey {
    provider: String,
    id: String,
    /// None scopes the cooldown to the whole credential.
    model: Option<String>,
}

#[derive(Debug, Clone)]
struct CooldownEntry {
    until: DateTime<Utc>,
    strikes: u32,
    reason: CooldownReason,
}

#[derive(Debug, Serialize, Clone)]
pub struct CooldownInfo {
    pub model: Option<String>,
    pub until_unix: i64,
    pub reason: CooldownReason,
}

#[derive(Debug, Serialize, Clone)]
pub struct AuthCredentialInfo {
    pub id: String,
    pub provider: String,
    pub status: AuthStatus,
    pub cooldowns: Vec<CooldownInfo>,
}

#[derive(Debug, Serialize, Clone)]
pub struct AuthPoolInfo {
    pub credentials: Vec<AuthCredentialInfo>,
}

/// Messages the pool actor handles.
enum AuthActorMessage {
    Register(AuthCredential, RpcReplyPort<Result<(), PolygateError>>),
    Unregister {
        provider: String,
        id: String,
        reply: RpcReplyPort<Result<(), PolygateError>>,
    },
    /// Fill-first pick of a usable credential, skipping cooldowns, statuses
    /// and already-tried ids. `sticky` prefers the credential previously
    /// pinned to the same idempotency key.
    Acquire {
        provider: String,
        model_key: String,
        exclude: Vec<String>,
        sticky: Option<u64>,
        reply: RpcReplyPort<Option<AuthCredential>>,
    },
    ReportSuccess {
        provider: String,
        id: String,
        model_key: String,
    },
    ReportFailure {
        provider: String,
        id: String,
        /// None cools the whole credential down rather than one model.
        model_key: Option<String>,
        reason: CooldownReason,
    },
    /// Writes refreshed token material back into the pool.
    Update(AuthCredential),
    SweepExpired,
    GetStatus(RpcReplyPort<AuthPoolInfo>),
}

struct AuthActorState {
    /// provider -> credentials in registration order
    pools: HashMap<String, Vec<AuthCredential>>,
    cooldowns: HashMap<CooldownKey, CooldownEntry>,
    sticky: Cache<u64, String>,
}

struct AuthActor;

impl AuthActor {
    fn log(state: &AuthActorState) {
        for (provider, pool) in &state.pools {
            info!("[{}] credentials: {}", provider, pool.len());
        }
    }

    fn cooldown_live(state: &AuthActorState, key: &CooldownKey, now: DateTime<Utc>) -> bool {
        state
            .cooldowns
            .get(key)
            .is_some_and(|entry| entry.until > now)
    }

    fn usable(
        state: &AuthActorState,
        auth: &AuthCredential,
        model_key: &str,
        exclude: &[String],
        now: DateTime<Utc>,
    ) -> bool {
        if !auth.selectable() || exclude.iter().any(|id| id == &auth.id) {
            return false;
        }
        let model_scoped = CooldownKey {
            provider: auth.provider.to_owned(),
            id: auth.id.to_owned(),
            model: Some(model_key.to_string()),
        };
        let global = CooldownKey {
            model: None,
            ..model_scoped.to_owned()
        };
        !Self::cooldown_live(state, &model_scoped, now)
            && !Self::cooldown_live(state, &global, now)
    }

    fn acquire(
        state: &mut AuthActorState,
        provider: &str,
        model_key: &str,
        exclude: &[String],
        sticky: Option<u64>,
    ) -> Option<AuthCredential> {
        let now = Utc::now();
        let pool = state.pools.get(provider)?;

        if let Some(hash) = sticky
            && let Some(pinned_id) = state.sticky.get(&hash)
            && let Some(auth) = pool.iter().find(|a| a.id == pinned_id)
            && Self::usable(state, auth, model_key, exclude, now)
        {
            let auth = auth.to_owned();
            state.sticky.insert(hash, auth.id.to_owned());
            return Some(auth);
        }

        let auth = pool
            .iter()
            .find(|a| Self::usable(state, a, model_key, exclude, now))?
            .to_owned();
        if let Some(hash) = sticky {
            state.sticky.insert(hash, auth.id.to_owned());
        }
        Some(auth)
    }

    fn register(state: &mut AuthActorState, auth: AuthCredential) -> Result<(), PolygateError> {
        let pool = state.pools.entry(auth.provider.to_owned()).or_default();
        if pool.iter().any(|a| a.id == auth.id) {
            return Err(PolygateError::InvalidInput {
                msg: format!("credential id already registered: {}", auth.id),
            });
        }
        pool.push(auth);
        Ok(())
    }

    fn unregister(
        state: &mut AuthActorState,
        provider: &str,
        id: &str,
    ) -> Result<(), PolygateError> {
        let Some(pool) = state.pools.get_mut(provider) else {
            return Err(PolygateError::UnexpectedNone {
                msg: "no such provider pool",
            });
        };
        let before = pool.len();
        pool.retain(|a| a.id != id);
        if pool.len() == before {
            return Err(PolygateError::UnexpectedNone {
                msg: "credential not found",
            });
        }
        state
            .cooldowns
            .retain(|key, _| !(key.provider == provider && key.id == id));
        Ok(())
    }

    fn report_success(state: &mut AuthActorState, provider: &str, id: &str, model_key: &str) {
        // any successful use clears this credential's cooldowns for the model
        // and resets its strike counters
        state.cooldowns.retain(|key, _| {
            !(key.provider == provider
                && key.id == id
                && (key.model.is_none() || key.model.as_deref() == Some(model_key)))
        });
        if let Some(pool) = state.pools.get_mut(provider)
            && let Some(auth) = pool.iter_mut().find(|a| a.id == id)
            && auth.status == AuthStatus::CoolingDown
        {
            auth.status = AuthStatus::Active;
        }
    }

    fn report_failure(
        state: &mut AuthActorState,
        provider: &str,
        id: &str,
        model_key: Option<String>,
        reason: CooldownReason,
    ) {
        let config = POLYGATE_CONFIG.load();
        let key = CooldownKey {
            provider: provider.to_string(),
            id: id.to_string(),
            model: model_key,
        };
        let strikes = state.cooldowns.get(&key).map_or(0, |e| e.strikes) + 1;
        let window = config
            .cooldown_base_secs
            .saturating_mul(1u64 << (strikes - 1).min(10))
            .min(config.cooldown_max_secs);
        let until = Utc::now() + chrono::Duration::seconds(window as i64);
        warn!(
            "[{}] cooling down {} for {}s ({})",
            provider, id, window, reason
        );
        state.cooldowns.insert(
            key,
            CooldownEntry {
                until,
                strikes,
                reason,
            },
        );
        if let Some(pool) = state.pools.get_mut(provider)
            && let Some(auth) = pool.iter_mut().find(|a| a.id == id)
        {
            auth.status = AuthStatus::CoolingDown;
            auth.last_error_at = Some(Utc::now());
        }
    }

    fn update(state: &mut AuthActorState, fresh: AuthCredential) {
        if let Some(pool) = state.pools.get_mut(&fresh.provider)
            && let Some(auth) = pool.iter_mut().find(|a| a.id == fresh.id)
        {
            auth.attributes = fresh.attributes;
        }
    }

    fn sweep(state: &mut AuthActorState) {
        let now = Utc::now();
        state.cooldowns.retain(|_, entry| entry.until > now);
        let live: std::collections::HashSet<(String, String)> = state
            .cooldowns
            .keys()
            .map(|key| (key.provider.to_owned(), key.id.to_owned()))
            .collect();
        for pool in state.pools.values_mut() {
            for auth in pool.iter_mut() {
                if auth.status == AuthStatus::CoolingDown
                    && !live.contains(&(auth.provider.to_owned(), auth.id.to_owned()))
                {
                    auth.status = AuthStatus::Active;
                }
            }
        }
    }

    fn report(state: &AuthActorState) -> AuthPoolInfo {
        let credentials = state
            .pools
            .values()
            .flatten()
            .map(|auth| AuthCredentialInfo {
                id: auth.id.to_owned(),
                provider: auth.provider.to_owned(),
                status: auth.status,
                cooldowns: state
                    .cooldowns
                    .iter()
                    .filter(|(key, _)| key.provider == auth.provider && key.id == auth.id)
                    .map(|(key, entry)| CooldownInfo {
                        model: key.model.to_owned(),
                        until_unix: entry.until.timestamp(),
                        reason: entry.reason,
                    })
                    .collect(),
            })
            .collect();
        AuthPoolInfo { credentials }
    }
}

impl Actor for AuthActor {
    type Msg = AuthActorMessage;
    type State = AuthActorState;
    type Arguments = Vec<AuthCredential>;

    async fn pre_start(
        &self,
        _myself: ActorRef<Self::Msg>,
        seed: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        let mut state = AuthActorState {
            pools: HashMap::new(),
            cooldowns: HashMap::new(),
            sticky: Cache::builder()
                .max_capacity(1000)
                .time_to_idle(std::time::Duration::from_secs(60 * 60))
                .build(),
        };
        for auth in seed {
            if let Err(e) = Self::register(&mut state, auth) {
                warn!("skipping credential at startup: {}", e);
            }
        }
        Self::log(&state);
        Ok(state)
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            AuthActorMessage::Register(auth, reply) => {
                let result = Self::register(state, auth);
                reply.send(result)?;
            }
            AuthActorMessage::Unregister {
                provider,
                id,
                reply,
            } => {
                let result = Self::unregister(state, &provider, &id);
                reply.send(result)?;
            }
            AuthActorMessage::Acquire {
                provider,
                model_key,
                exclude,
                sticky,
                reply,
            } => {
                let picked = Self::acquire(state, &provider, &model_key, &exclude, sticky);
                reply.send(picked)?;
            }
            AuthActorMessage::ReportSuccess {
                provider,
                id,
                model_key,
            } => {
                Self::report_success(state, &provider, &id, &model_key);
            }
            AuthActorMessage::ReportFailure {
                provider,
                id,
                model_key,
                reason,
            } => {
                Self::report_failure(state, &provider, &id, model_key, reason);
            }
            AuthActorMessage::Update(auth) => {
                Self::update(state, auth);
            }
            AuthActorMessage::SweepExpired => {
                Self::sweep(state);
            }
            AuthActorMessage::GetStatus(reply) => {
                reply.send(Self::report(state))?;
            }
        }
        Ok(())
    }
}

/// Handle for interacting with the pool actor.
#[derive(Clone)]
pub struct AuthPoolHandle {
    actor_ref: ActorRef<AuthActorMessage>,
}

impl AuthPoolHandle {
    /// Spawns the pool actor seeded with `credentials` and starts the
    /// periodic cooldown sweeper.
    pub async fn start(credentials: Vec<AuthCredential>) -> Result<Self, ractor::SpawnErr> {
        let (actor_ref, _join_handle) = Actor::spawn(None, AuthActor, credentials).await?;
        let handle = Self { actor_ref };
        handle.spawn_sweeper().await;
        Ok(handle)
    }

    async fn spawn_sweeper(&self) {
        let actor_ref = self.actor_ref.to_owned();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(std::time::Duration::from_secs(SWEEP_INTERVAL_SECS));
            loop {
                interval.tick().await;
                if actor_ref.cast(AuthActorMessage::SweepExpired).is_err() {
                    break;
                }
            }
        });
    }

    fn comm_error(op: &str, e: impl std::fmt::Display) -> PolygateError {
        PolygateError::RactorError {
            loc: Location::generate(),
            msg: format!("Failed to communicate with pool actor for {op}: {e}"),
        }
    }

    pub async fn register(&self, auth: AuthCredential) -> Result<(), PolygateError> {
        ractor::call!(self.actor_ref, AuthActorMessage::Register, auth)
            .map_err(|e| Self::comm_error("register", e))?
    }

    pub async fn unregister(&self, provider: &str, id: &str) -> Result<(), PolygateError> {
        let provider = provider.to_string();
        let id = id.to_string();
        ractor::call!(self.actor_ref, |reply| AuthActorMessage::Unregister {
            provider,
            id,
            reply
        })
        .map_err(|e| Self::comm_error("unregister", e))?
    }

    pub async fn acquire(
        &self,
        provider: &str,
        model_key: &str,
        exclude: Vec<String>,
        sticky: Option<u64>,
    ) -> Result<Option<AuthCredential>, PolygateError> {
        let provider = provider.to_string();
        let model_key = model_key.to_string();
        ractor::call!(self.actor_ref, |reply| AuthActorMessage::Acquire {
            provider,
            model_key,
            exclude,
            sticky,
            reply
        })
        .map_err(|e| Self::comm_error("acquire", e))
    }

    pub async fn report_success(&self, provider: &str, id: &str, model_key: &str) {
        let _ = self.actor_ref.cast(AuthActorMessage::ReportSuccess {
            provider: provider.to_string(),
            id: id.to_string(),
            model_key: model_key.to_string(),
        });
    }

    pub async fn report_failure(
        &self,
        provider: &str,
        id: &str,
        model_key: Option<String>,
        reason: CooldownReason,
    ) {
        let _ = self.actor_ref.cast(AuthActorMessage::ReportFailure {
            provider: provider.to_string(),
            id: id.to_string(),
            model_key,
            reason,
        });
    }

    pub async fn update(&self, auth: AuthCredential) {
        let _ = self.actor_ref.cast(AuthActorMessage::Update(auth));
    }

    pub async fn get_status(&self) -> Result<AuthPoolInfo, PolygateError> {
        ractor::call!(self.actor_ref, AuthActorMessage::GetStatus)
            .map_err(|e| Self::comm_error("get status", e))
    }
}
