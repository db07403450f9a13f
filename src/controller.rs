//! Load-test controller workflow: load, apply, run, sample, verify, stop.
//!
//! Every state-changing command goes through a connection check and the
//! configured retry policy.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::{info, warn};

use crate::config::ControllerConfig;
use crate::error::{ControlError, Result};
use crate::operation::{self, PollConfig};
use crate::retry::{with_connection_check, with_retry};
use crate::sampler::{self, SampleRun};
use crate::session::Session;
use crate::stats::{Profile, StatsSource, ViewSource};
use crate::transport::Transport;
use crate::verify::{check_entities, ComparisonReport, GoldenProfile, ThresholdConfig, VerificationResult};

pub struct TestController {
    session: Session,
    config: ControllerConfig,
    golden: GoldenProfile,
}

impl TestController {
    /// Validate `config` and create a remote session. The session is not
    /// started until the first command needs it.
    pub async fn connect(transport: Arc<dyn Transport>, config: ControllerConfig) -> Result<Self> {
        config.validate()?;
        let session = Session::create(transport, &config.api.base_url(), &config.api.session_params()).await?;
        Ok(Self {
            session,
            config,
            golden: GoldenProfile::default(),
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn golden(&self) -> Option<&Profile> {
        self.golden.get()
    }

    pub fn set_golden(&mut self, profile: Profile) {
        self.golden.set(profile);
    }

    async fn run_operation(&self, name: &str, payload: Option<Value>, poll: PollConfig) -> Result<()> {
        let path = format!("{}{}", self.config.endpoints.operations, name);
        let policy = self.config.retry.policy();

        let session = &self.session;
        let path = path.as_str();
        let payload = payload.as_ref();
        let poll = &poll;
        with_retry(&policy, name, move || {
            with_connection_check(session, operation::execute(session, path, payload, poll))
        })
        .await
    }

    pub async fn start_session(&mut self) -> Result<()> {
        let poll = self.config.polling.slow();
        self.session.start(&poll).await
    }

    /// Load a test configuration file that lives on the controller host,
    /// then apply it.
    pub async fn load_test(&mut self, path: &str) -> Result<()> {
        self.start_session().await?;
        let file_path = path.replace('\'', "");
        let file_path = file_path.trim();
        info!(file = %file_path, "loading test configuration; this can take minutes");
        self.run_operation("loadTest", Some(json!({ "fullPath": file_path })), self.config.polling.slow())
            .await?;
        self.apply_config().await
    }

    pub async fn apply_config(&self) -> Result<()> {
        self.run_operation("applyConfiguration", None, self.config.polling.fast())
            .await
    }

    pub async fn start_test(&self) -> Result<()> {
        info!("starting test");
        self.apply_config().await?;
        self.run_operation("runTest", None, self.config.polling.slow()).await
    }

    /// Current `currentState` of the active test.
    pub async fn test_state(&self) -> Result<String> {
        let probe = self.session.resolve(&self.config.endpoints.active_test)?;
        sampler::read_state(&self.session, &probe).await
    }

    /// Gracefully stop the test if it is running. Returns whether a stop
    /// command was sent.
    pub async fn stop_test(&self) -> Result<bool> {
        let state = self.test_state().await?;
        if !state.eq_ignore_ascii_case(&self.config.endpoints.active_state) {
            info!(%state, "test not running, nothing to stop");
            return Ok(false);
        }
        info!("stopping test");
        self.run_operation("gracefulStopRun", None, self.config.polling.slow())
            .await?;
        Ok(true)
    }

    /// Sample run-time metrics until the test leaves the active state.
    pub async fn gather_stats(&self) -> Result<SampleRun> {
        let endpoints = &self.config.endpoints;
        sampler::sample_while_active(
            &self.session,
            &endpoints.active_test,
            &endpoints.stats_values,
            &endpoints.active_state,
            &self.config.sampler,
        )
        .await
    }

    fn view_source(&self) -> ViewSource<'_> {
        ViewSource::new(
            &self.session,
            self.config.endpoints.stats_view.clone(),
            self.config.endpoints.stats_columns.clone(),
        )
    }

    fn flow_source(&self) -> ViewSource<'_> {
        ViewSource::new(
            &self.session,
            self.config.endpoints.flow_view.clone(),
            self.config.endpoints.flow_columns.clone(),
        )
    }

    /// Read the per-stream statistics view, optionally keeping it as the
    /// golden profile.
    pub async fn capture_profile(&mut self, set_golden: bool) -> Result<Profile> {
        let profile = self.view_source().snapshot().await?;
        if set_golden {
            self.golden.set(profile.clone());
        }
        Ok(profile)
    }

    /// Threshold check over the live statistics view. `streams` limits the
    /// check to those stream names; empty checks all of them.
    pub async fn check_traffic(&self, streams: &[String]) -> Result<VerificationResult> {
        let verification = &self.config.verification;
        let tolerances = verification.tolerance_table()?;
        let source = self.view_source();
        check_entities(&source, streams, &tolerances, &verification.threshold()).await
    }

    /// Single-pass loss/outage check of every flow group in the flow
    /// statistics view. Flow groups are told apart by VLAN.
    pub async fn check_flow_groups(&self, streams: &[String]) -> Result<VerificationResult> {
        let verification = &self.config.verification;
        let tolerances = verification.tolerance_table()?;
        let once = ThresholdConfig {
            max_iterations: 1,
            ..verification.threshold()
        };
        check_entities(&self.flow_source(), streams, &tolerances, &once).await
    }

    /// Stop the test once `outcome` has been produced against it, whether
    /// or not it failed. The outcome's own error wins over a failed stop.
    pub async fn conclude<T, E>(&self, outcome: std::result::Result<T, E>) -> std::result::Result<T, E>
    where
        E: From<ControlError>,
    {
        let stopped = self.stop_test().await;
        match (outcome, stopped) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(_)) => Err(e),
            (Err(e), Err(stop_err)) => {
                warn!(error = %stop_err, "failed to stop test after an earlier failure");
                Err(e)
            }
        }
    }

    /// Capture the current profile and compare it with the golden one.
    pub async fn compare_to_golden(&mut self) -> Result<ComparisonReport> {
        let current = self.capture_profile(false).await?;
        let verification = &self.config.verification;
        self.golden
            .compare_current(
                &current,
                verification.compare_loss_tolerance,
                verification.compare_rate_tolerance,
            )?
            .into_result()
    }

    /// Delete the remote session.
    pub async fn release(mut self) {
        self.session.release().await;
    }
}
