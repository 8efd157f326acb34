use tracing::{error, info};

/// Accumulates the reload and restart verdicts of one reconcile pass.
///
/// A restart supersedes a reload; both are cleared by [`Instance::reset`]
/// once the pass has been applied.
#[derive(Default, Debug)]
pub struct Instance {
    reload: bool,
    restart: bool,
    reasons: Vec<String>,
}

impl Instance {
    #[track_caller]
    pub fn reload(&mut self, reason: impl Into<String>) {
        self.reload = true;
        let reason = reason.into();
        if reason.is_empty() {
            error!(caller = %std::panic::Location::caller(), "empty reason for reload");
            return;
        }
        info!("reload required : {reason}");
        self.reasons.push(reason);
    }

    #[track_caller]
    pub fn reload_if(&mut self, condition: bool, reason: impl Into<String>) {
        if condition {
            self.reload(reason);
        }
    }

    #[track_caller]
    pub fn restart(&mut self, reason: impl Into<String>) {
        self.restart = true;
        let reason = reason.into();
        if reason.is_empty() {
            error!(caller = %std::panic::Location::caller(), "empty reason for restart");
            return;
        }
        info!("restart required : {reason}");
        self.reasons.push(reason);
    }

    #[track_caller]
    pub fn restart_if(&mut self, condition: bool, reason: impl Into<String>) {
        if condition {
            self.restart(reason);
        }
    }

    pub fn need_reload(&self) -> bool {
        self.reload
    }

    pub fn need_restart(&self) -> bool {
        self.restart
    }

    pub fn reasons(&self) -> &[String] {
        &self.reasons
    }

    pub fn reset(&mut self) {
        self.reload = false;
        self.restart = false;
        self.reasons.clear();
    }
}
