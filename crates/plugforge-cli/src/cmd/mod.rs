pub mod addon;
pub mod build;
pub mod clean;
pub mod config;
pub mod deploy;
pub mod registry;

use plugforge_core::signals;
use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Drive `work` to completion on a fresh multi-thread runtime. SIGINT and
/// SIGTERM cancel `token` while it runs.
pub fn block_on<F, T>(token: CancellationToken, work: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let listener = signals::cancel_on_interrupt(token);
        let out = work.await;
        listener.abort();
        out
    })
}
