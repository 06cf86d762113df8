//! User-defined function runtime integration
//!
//! A UDF is workspace-owned source code compiled by an external factory
//! into an isolated sandbox. Rotor owns the lifecycle around that sandbox:
//! the compiled-wrapper cache keyed by content hash, detection of disposed
//! interpreters, and release of sandbox resources on eviction.

mod registry;

pub use registry::{CompiledUdf, UdfRegistry};

use crate::error::Result;
use crate::model::{AnalyticsEvent, UdfContext};
use crate::store::KvBinding;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// What a user function produced for one input event.
#[derive(Debug)]
pub enum UdfOutput {
    /// Replace the event.
    One(AnalyticsEvent),
    /// Fan out; order is preserved downstream.
    Many(Vec<AnalyticsEvent>),
    /// Remove the event from the chain.
    Drop,
}

/// Handle to a compiled UDF sandbox.
///
/// `invoke` may fail with [`crate::error::RotorError::SandboxDisposed`] when
/// the isolated interpreter was torn down between invocations; callers
/// rebuild and retry once. `close` must be idempotent: it runs from the
/// cache release hook and may race a concurrent shutdown.
#[async_trait]
pub trait UdfWrapper: Send + Sync {
    async fn invoke(
        &self,
        event: AnalyticsEvent,
        ctx: &UdfContext,
        store: &KvBinding,
    ) -> Result<UdfOutput>;

    fn close(&self);
}

/// External compiler producing sandbox wrappers from source code.
#[async_trait]
pub trait UdfCompiler: Send + Sync {
    async fn compile(&self, id: &str, name: &str, code: &str) -> Result<Arc<dyn UdfWrapper>>;
}

/// Placeholder compiler wired when no sandbox runtime is linked into the
/// build. Every compile fails with a configuration error; deployments
/// supply a real [`UdfCompiler`] through the worker constructor.
pub struct DisabledCompiler;

#[async_trait]
impl UdfCompiler for DisabledCompiler {
    async fn compile(&self, id: &str, _name: &str, _code: &str) -> Result<Arc<dyn UdfWrapper>> {
        Err(crate::error::RotorError::Config(format!(
            "cannot compile '{id}': no UDF runtime is linked into this build"
        )))
    }
}

/// Deterministic content hash of UDF source; the compiled-artifact cache key.
pub fn code_hash(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
