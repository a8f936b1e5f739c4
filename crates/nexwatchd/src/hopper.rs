//! Channel Hopper
//!
//! Rate-limited channel changes with band-aware dwell times. Tracks the
//! failure streak and pauses itself after too many consecutive errors so a
//! wedged driver is not hammered with further `iw` calls.

use crate::commands::InterfaceCommands;
use crate::executor::CommandRunner;
use chrono::Utc;
use nexwatch_common::{BoundedHistory, Channel, HopRecord, HopStats, HopperConfig};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Called after every failed hop with the channel and the error text.
pub type HopErrorCallback = Arc<dyn Fn(Channel, &str) + Send + Sync>;

/// Minimum dwell before hopping from `from` to `to`.
pub fn required_delay(config: &HopperConfig, from: Option<Channel>, to: Channel) -> Duration {
    let mut delay = config.hop_delay();
    if to.band() == nexwatch_common::Band::High {
        delay = delay.max(config.high_band_delay());
    }
    if let Some(from) = from {
        if from.band() != to.band() {
            delay = delay.max(config.band_switch_delay());
        }
    }
    delay
}

struct HopperState {
    current_channel: Option<Channel>,
    last_hop: Option<Instant>,
    consecutive_errors: u32,
    paused_until: Option<Instant>,
    total: u64,
    successful: u64,
    failed: u64,
    recovery_pauses: u64,
    last_error: Option<String>,
    history: BoundedHistory<HopRecord>,
}

impl HopperState {
    /// Whether the pause is still running. An expired pause is cleared
    /// here, together with the streak that caused it.
    fn check_pause(&mut self, now: Instant) -> bool {
        match self.paused_until {
            Some(until) if now < until => true,
            Some(_) => {
                self.paused_until = None;
                self.consecutive_errors = 0;
                info!("Channel hopper pause expired, resuming");
                false
            }
            None => false,
        }
    }
}

struct AutoHop {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ChannelHopper {
    config: HopperConfig,
    commands: Arc<InterfaceCommands>,
    runner: Arc<dyn CommandRunner>,
    state: Mutex<HopperState>,
    /// Serializes hops so dwell accounting sees one hop at a time
    hop_lock: tokio::sync::Mutex<()>,
    on_error: Mutex<Option<HopErrorCallback>>,
    auto: Mutex<Option<AutoHop>>,
}

impl ChannelHopper {
    pub fn new(
        config: HopperConfig,
        commands: Arc<InterfaceCommands>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let history = BoundedHistory::new(config.history_len);
        Self {
            config,
            commands,
            runner,
            state: Mutex::new(HopperState {
                current_channel: None,
                last_hop: None,
                consecutive_errors: 0,
                paused_until: None,
                total: 0,
                successful: 0,
                failed: 0,
                recovery_pauses: 0,
                last_error: None,
                history,
            }),
            hop_lock: tokio::sync::Mutex::new(()),
            on_error: Mutex::new(None),
            auto: Mutex::new(None),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, HopperState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_error_callback(&self, callback: HopErrorCallback) {
        *self.on_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(callback);
    }

    /// Hop to `channel`. Returns whether the channel was set.
    ///
    /// While paused, a non-forced hop returns false without running
    /// anything. `force` skips both the pause check and the dwell wait.
    pub async fn hop_to(&self, channel: Channel, force: bool) -> bool {
        let _serial = self.hop_lock.lock().await;

        let wait = {
            let mut state = self.lock_state();
            let now = Instant::now();
            if state.check_pause(now) && !force {
                debug!("Hop to {} skipped: hopper paused", channel);
                return false;
            }
            match (force, state.last_hop) {
                (false, Some(last)) => {
                    let delay = required_delay(&self.config, state.current_channel, channel);
                    delay.saturating_sub(now.duration_since(last))
                }
                _ => Duration::ZERO,
            }
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let spec = self.commands.set_channel(channel);
        let result = self.runner.run_checked(&spec).await;

        let failure = {
            let mut state = self.lock_state();
            let now = Instant::now();
            state.last_hop = Some(now);
            state.total += 1;

            match result {
                Ok(_) => {
                    state.current_channel = Some(channel);
                    state.consecutive_errors = 0;
                    state.paused_until = None;
                    state.successful += 1;
                    state.history.push(HopRecord {
                        timestamp: Utc::now(),
                        channel,
                        success: true,
                        error: None,
                    });
                    None
                }
                Err(e) => {
                    let error = e.summary();
                    state.consecutive_errors += 1;
                    state.failed += 1;
                    state.last_error = Some(error.clone());
                    state.history.push(HopRecord {
                        timestamp: Utc::now(),
                        channel,
                        success: false,
                        error: Some(error.clone()),
                    });
                    warn!(
                        "Hop to channel {} failed ({} in a row): {}",
                        channel, state.consecutive_errors, error
                    );

                    if state.consecutive_errors >= self.config.max_consecutive_errors
                        && state.paused_until.is_none()
                    {
                        state.paused_until = Some(now + self.config.recovery_pause());
                        state.recovery_pauses += 1;
                        warn!(
                            "Channel hopper pausing for {:?} after {} consecutive errors",
                            self.config.recovery_pause(),
                            state.consecutive_errors
                        );
                    }
                    Some(error)
                }
            }
        };

        match failure {
            None => {
                debug!("Hopped to channel {}", channel);
                true
            }
            Some(error) => {
                let callback = self.on_error.lock().unwrap_or_else(|e| e.into_inner()).clone();
                if let Some(callback) = callback {
                    callback(channel, &error);
                }
                false
            }
        }
    }

    pub fn current_channel(&self) -> Option<Channel> {
        self.lock_state().current_channel
    }

    pub fn get_stats(&self) -> HopStats {
        let mut state = self.lock_state();
        let in_recovery_pause = state.check_pause(Instant::now());
        HopStats {
            current_channel: state.current_channel,
            total_hops: state.total,
            successful_hops: state.successful,
            failed_hops: state.failed,
            recovery_pauses: state.recovery_pauses,
            consecutive_errors: state.consecutive_errors,
            in_recovery_pause,
            last_error: state.last_error.clone(),
            success_rate: HopStats::success_rate(state.successful, state.total),
        }
    }

    /// Hop records, oldest first.
    pub fn history(&self) -> Vec<HopRecord> {
        self.lock_state().history.to_vec()
    }

    /// Start hopping over `channels` every `interval`. Returns false if the
    /// list is empty or a loop is already running.
    pub fn start_auto_hop(self: &Arc<Self>, channels: Vec<Channel>, interval: Duration) -> bool {
        if channels.is_empty() {
            warn!("Auto-hop not started: empty channel list");
            return false;
        }
        let mut auto = self.auto.lock().unwrap_or_else(|e| e.into_inner());
        if auto.is_some() {
            return false;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        let hopper = Arc::clone(self);
        info!(
            "Auto-hop started over {} channels every {:?}",
            channels.len(),
            interval
        );

        let handle = tokio::spawn(async move {
            for channel in channels.iter().cycle() {
                if *stop_rx.borrow() {
                    break;
                }
                hopper.hop_to(*channel, false).await;
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = stop_rx.changed() => break,
                }
            }
            debug!("Auto-hop loop exited");
        });

        *auto = Some(AutoHop {
            stop: stop_tx,
            handle,
        });
        true
    }

    pub fn is_auto_hopping(&self) -> bool {
        self.auto.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Stop the auto-hop loop and wait for it. A hop in flight finishes
    /// first. Calling this when nothing runs is a no-op.
    pub async fn stop(&self) {
        let auto = self.auto.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(auto) = auto {
            let _ = auto.stop.send(true);
            if let Err(e) = auto.handle.await {
                warn!("Auto-hop task ended abnormally: {}", e);
            }
            info!("Auto-hop stopped");
        }
    }
}
