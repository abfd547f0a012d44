use crate::context::SupervisorContext;
use crate::managed::ManagedProcess;
use crate::pool::{PoolReport, ProcessPool};
use tracing::{info, warn};
use unitd_core::{HandshakeReport, PoolDefinition, ProcessState, UnitdError};

/// Start every member of `definition` in order, report whether startup
/// succeeded through `on_started`, then supervise until the pool shuts down.
///
/// `on_started` is called exactly once, before the pool starts waiting. An
/// error returned before any member starts is reported to it as a failed
/// startup first.
pub async fn supervise<F>(
    definition: PoolDefinition,
    ctx: &SupervisorContext,
    on_started: F,
) -> Result<PoolReport, UnitdError>
where
    F: FnOnce(&HandshakeReport),
{
    let prepared = definition.validate().and_then(|()| {
        let mut pool = ProcessPool::new(ctx);
        if let Some(signal) = definition.quit_signal {
            pool.set_quit_signal(signal)?;
        }
        Ok(pool)
    });
    let mut pool = match prepared {
        Ok(pool) => pool,
        Err(e) => {
            warn!("Startup failed: {}", e);
            on_started(&HandshakeReport::failed(e.to_string()));
            return Err(e);
        }
    };

    let total = definition.processes.len();
    for member in definition.processes {
        let process = ManagedProcess::new(member.spec, member.readiness);
        if !pool.start_sync(process).await {
            break;
        }
    }

    let started = pool.processes().len() == total
        && pool
            .processes()
            .iter()
            .all(|p| p.state() == ProcessState::Running);

    let handshake = if started {
        info!("All {} processes running", total);
        HandshakeReport::started(definition.url.unwrap_or_default())
    } else {
        let reason = pool
            .report()
            .first_failure()
            .unwrap_or_else(|| "startup was interrupted".to_string());
        warn!("Startup failed: {}", reason);
        HandshakeReport::failed(reason)
    };
    on_started(&handshake);

    Ok(pool.run().await)
}
