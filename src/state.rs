// src/state.rs

use std::sync::Arc;

use axum::extract::FromRef;

use crate::{
    config::Config,
    grading::{
        builders::BuildService, fitb::FitbGrader, lp::LpGrader, server_side::ServerSideJs,
    },
    registry::{AnswerTableRegistry, RegistryError},
    sandbox::SandboxPool,
    store::EventStore,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub config: Config,
    pub registry: Arc<AnswerTableRegistry>,
    pub sandbox: Arc<SandboxPool>,
}

impl AppState {
    /// Wires the graders and the answer-table registry around `store`.
    pub fn new(
        config: Config,
        store: Arc<dyn EventStore>,
        sandbox: Arc<SandboxPool>,
    ) -> Result<Self, RegistryError> {
        let builds = Arc::new(BuildService::new(config.build.clone(), sandbox.clone()));
        let registry = AnswerTableRegistry::standard(
            Arc::new(FitbGrader::new(
                config.is_exam,
                config.book_path.clone(),
                ServerSideJs::from_config(&config.server_js),
            )),
            Arc::new(LpGrader::new(config.book_path.clone(), builds)),
        )?;

        Ok(Self {
            store,
            config,
            registry: Arc::new(registry),
            sandbox,
        })
    }
}

impl FromRef<AppState> for Arc<dyn EventStore> {
    fn from_ref(state: &AppState) -> Self {
        state.store.clone()
    }
}

impl FromRef<AppState> for Config {
    fn from_ref(state: &AppState) -> Self {
        state.config.clone()
    }
}

impl FromRef<AppState> for Arc<AnswerTableRegistry> {
    fn from_ref(state: &AppState) -> Self {
        state.registry.clone()
    }
}
