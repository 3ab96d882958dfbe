use crate::context::BuildContext;
use crate::pipeline::{BuildTask, TaskResult};
use crate::signing::{CredentialRegistry, SigningSession};
use crate::tools::ToolRunner;
use std::sync::Arc;

/// Signs the bundle inside an ephemeral keychain session.
pub struct SignTask {
    session: SigningSession,
}

impl SignTask {
    pub fn new(runner: Arc<dyn ToolRunner>, registry: Arc<dyn CredentialRegistry>) -> Self {
        Self {
            session: SigningSession::new(runner, registry),
        }
    }
}

impl BuildTask for SignTask {
    fn name(&self) -> &str {
        "sign"
    }

    fn run(&self, ctx: &mut BuildContext) -> TaskResult {
        let ctx = &*ctx;
        self.session
            .with_signing_identity(ctx, |_keychain| self.session.sign_bundle(ctx))
    }
}
