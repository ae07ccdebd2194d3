/// Command channel to the fan, with a short-lived state cache
use async_trait::async_trait;
use log::{debug, info};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, Instant};

use crate::error::{Error, Result};
use crate::fan::profile::ProfileParams;
use crate::models::FanState;

/// Remote control surface of the appliance.
///
/// Every command is a round trip to the device and may fail transiently.
#[async_trait]
pub trait FanSink: Send + Sync {
    async fn get_state(&self, id: &str) -> Result<Option<FanState>>;
    async fn set_power(&self, id: &str, on: bool) -> Result<()>;
    async fn set_speed(&self, id: &str, speed: u8) -> Result<()>;
    async fn set_oscillation(&self, id: &str, params: &ProfileParams) -> Result<()>;
    async fn set_position(&self, id: &str, position: [i16; 2]) -> Result<()>;
}

#[async_trait]
impl<S: FanSink + ?Sized> FanSink for Arc<S> {
    async fn get_state(&self, id: &str) -> Result<Option<FanState>> {
        (**self).get_state(id).await
    }
    async fn set_power(&self, id: &str, on: bool) -> Result<()> {
        (**self).set_power(id, on).await
    }
    async fn set_speed(&self, id: &str, speed: u8) -> Result<()> {
        (**self).set_speed(id, speed).await
    }
    async fn set_oscillation(&self, id: &str, params: &ProfileParams) -> Result<()> {
        (**self).set_oscillation(id, params).await
    }
    async fn set_position(&self, id: &str, position: [i16; 2]) -> Result<()> {
        (**self).set_position(id, position).await
    }
}

/// Wraps a sink and serves `get_state` from a cache for `expiry`.
///
/// Commands pass straight through and drop the cached entry, since the state
/// they change would otherwise be reported stale.
pub struct CachedFan<S> {
    inner: S,
    expiry: Duration,
    cache: Mutex<Option<(Instant, Option<FanState>)>>,
}

impl<S: FanSink> CachedFan<S> {
    pub fn new(inner: S, expiry: Duration) -> Self {
        Self {
            inner,
            expiry,
            cache: Mutex::new(None),
        }
    }

    fn invalidate(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }
}

#[async_trait]
impl<S: FanSink> FanSink for CachedFan<S> {
    async fn get_state(&self, id: &str) -> Result<Option<FanState>> {
        if let Ok(cache) = self.cache.lock() {
            if let Some((fetched_at, state)) = *cache {
                if fetched_at.elapsed() < self.expiry {
                    return Ok(state);
                }
            }
        }
        let state = self.inner.get_state(id).await?;
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some((Instant::now(), state));
        }
        Ok(state)
    }

    async fn set_power(&self, id: &str, on: bool) -> Result<()> {
        let result = self.inner.set_power(id, on).await;
        self.invalidate();
        result
    }

    async fn set_speed(&self, id: &str, speed: u8) -> Result<()> {
        let result = self.inner.set_speed(id, speed).await;
        self.invalidate();
        result
    }

    async fn set_oscillation(&self, id: &str, params: &ProfileParams) -> Result<()> {
        let result = self.inner.set_oscillation(id, params).await;
        self.invalidate();
        result
    }

    async fn set_position(&self, id: &str, position: [i16; 2]) -> Result<()> {
        let result = self.inner.set_position(id, position).await;
        self.invalidate();
        result
    }
}

/// A command as received by [`SimulatedFan`]
#[derive(Debug, Clone, PartialEq)]
pub enum FanCommand {
    Power(bool),
    Speed(u8),
    Oscillation(ProfileParams),
    Position([i16; 2]),
}

#[derive(Debug)]
struct Simulation {
    state: FanState,
    commands: Vec<FanCommand>,
    state_reads: usize,
    failures_left: usize,
}

/// In-process appliance that keeps its own state and logs every command.
///
/// Used for dry runs when no real appliance is wired in, and by the tests.
#[derive(Debug)]
pub struct SimulatedFan {
    latency: Duration,
    sim: Mutex<Simulation>,
}

impl Default for SimulatedFan {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedFan {
    pub fn new() -> Self {
        Self {
            latency: Duration::ZERO,
            sim: Mutex::new(Simulation {
                state: FanState {
                    power_on: false,
                    wind_level: 1,
                    temperature_f: None,
                },
                commands: Vec::new(),
                state_reads: 0,
                failures_left: 0,
            }),
        }
    }

    /// Delay every call by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_temperature(&self, temperature_f: Option<f32>) {
        self.with_sim(|sim| sim.state.temperature_f = temperature_f);
    }

    /// Make the next `count` commands fail
    pub fn fail_next(&self, count: usize) {
        self.with_sim(|sim| sim.failures_left = count);
    }

    pub fn state(&self) -> FanState {
        self.with_sim(|sim| sim.state)
    }

    pub fn commands(&self) -> Vec<FanCommand> {
        self.with_sim(|sim| sim.commands.clone())
    }

    pub fn state_reads(&self) -> usize {
        self.with_sim(|sim| sim.state_reads)
    }

    fn with_sim<T>(&self, f: impl FnOnce(&mut Simulation) -> T) -> T {
        let mut sim = match self.sim.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut sim)
    }

    async fn command(&self, name: &'static str, id: &str, command: FanCommand) -> Result<()> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        self.with_sim(|sim| {
            if sim.failures_left > 0 {
                sim.failures_left -= 1;
                return Err(Error::Actuator {
                    command: name,
                    reason: "simulated failure".into(),
                });
            }
            info!("Fan {}: {:?}", id, command);
            match command {
                FanCommand::Power(on) => sim.state.power_on = on,
                FanCommand::Speed(level) => sim.state.wind_level = level,
                FanCommand::Oscillation(_) | FanCommand::Position(_) => {}
            }
            sim.commands.push(command);
            Ok(())
        })
    }
}

#[async_trait]
impl FanSink for SimulatedFan {
    async fn get_state(&self, id: &str) -> Result<Option<FanState>> {
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        let state = self.with_sim(|sim| {
            sim.state_reads += 1;
            sim.state
        });
        debug!("Fan {} state: {:?}", id, state);
        Ok(Some(state))
    }

    async fn set_power(&self, id: &str, on: bool) -> Result<()> {
        self.command("power", id, FanCommand::Power(on)).await
    }

    async fn set_speed(&self, id: &str, speed: u8) -> Result<()> {
        self.command("speed", id, FanCommand::Speed(speed)).await
    }

    async fn set_oscillation(&self, id: &str, params: &ProfileParams) -> Result<()> {
        self.command("oscillation", id, FanCommand::Oscillation(*params))
            .await
    }

    async fn set_position(&self, id: &str, position: [i16; 2]) -> Result<()> {
        self.command("position", id, FanCommand::Position(position))
            .await
    }
}
