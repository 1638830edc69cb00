/// The relay event loop.
///
/// A single async task that owns all mutable relay state and multiplexes
/// over application commands, task outcomes and timers. Every input is
/// handled to completion before the next one is taken.
use tokio::sync::mpsc;

use crate::gateway::ExternalTransport;
use crate::types::now_ms;

use super::effect::TaskOutcome;
use super::executor::Executor;
use super::link::LinkLayer;
use super::state::RelayState;
use super::{RuntimeCommand, RuntimeConfig};

pub(super) async fn runtime_loop<L: LinkLayer, E: ExternalTransport>(
    mut state: RelayState,
    executor: Executor<L, E>,
    config: RuntimeConfig,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
    mut outcome_rx: mpsc::Receiver<TaskOutcome>,
) {
    // ── Timers ──────────────────────────────────────────────────────
    let mut sweep = tokio::time::interval(config.sweep_interval);
    let mut liveness = tokio::time::interval(config.liveness_interval);
    let mut reroute = tokio::time::interval(config.reroute_interval);
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    let mut gateway = tokio::time::interval(config.gateway_interval);

    // Skip the immediate first tick on all intervals
    sweep.tick().await;
    liveness.tick().await;
    reroute.tick().await;
    heartbeat.tick().await;
    gateway.tick().await;

    tracing::info!(local_id = %state.local_id, "relay runtime started");

    loop {
        tokio::select! {
            // ── 1. Application / platform input ─────────────────
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                let now = now_ms();
                match cmd {
                    RuntimeCommand::NeighborDiscovered { device_id, link_quality } => {
                        executor.execute(state.handle_neighbor_discovered(device_id, link_quality, now));
                    }
                    RuntimeCommand::NeighborConnected { device_id } => {
                        executor.execute(state.handle_neighbor_connected(device_id, now));
                    }
                    RuntimeCommand::NeighborLost { device_id } => {
                        executor.execute(state.handle_neighbor_lost(device_id));
                    }
                    RuntimeCommand::BytesReceived { from, bytes } => {
                        executor.execute(state.handle_bytes_received(from, &bytes, now));
                    }
                    RuntimeCommand::ConnectivityGained => {
                        executor.execute(state.handle_connectivity_gained(now));
                    }
                    RuntimeCommand::ConnectivityLost => {
                        executor.execute(state.handle_connectivity_lost());
                    }
                    RuntimeCommand::SubmitLocal {
                        kind,
                        payload,
                        ttl_hops,
                        validity,
                        reply,
                    } => {
                        let (result, effects) =
                            state.handle_submit_local(kind, payload, ttl_hops, validity, now);
                        executor.execute(effects);
                        let _ = reply.send(result);
                    }
                    RuntimeCommand::GetNeighbors { reply } => {
                        let _ = reply.send(state.neighbor_snapshot());
                    }
                    RuntimeCommand::GetRecord { id, reply } => {
                        let _ = reply.send(state.record(&id));
                    }
                    RuntimeCommand::Shutdown => {
                        tracing::info!("relay runtime shutting down");
                        break;
                    }
                }
            }

            // ── 2. Spawned sends / connects / uploads ───────────
            Some(outcome) = outcome_rx.recv() => {
                executor.execute(state.handle_outcome(outcome, now_ms()));
            }

            // ── 3. Timers ───────────────────────────────────────
            _ = sweep.tick() => {
                let now = now_ms();
                executor.execute(state.tick_sweep(now));
                executor.purge_journal(now);
            }
            _ = liveness.tick() => {
                executor.execute(state.tick_liveness(now_ms()));
            }
            _ = reroute.tick() => {
                executor.execute(state.tick_reroute(now_ms()));
            }
            _ = heartbeat.tick() => {
                executor.execute(state.tick_heartbeat(now_ms()));
            }
            _ = gateway.tick() => {
                executor.execute(state.tick_gateway(now_ms()));
            }
        }
    }
}
