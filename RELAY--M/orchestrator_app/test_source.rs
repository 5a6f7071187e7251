use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use relay_rules::{SourceEnvelope, SourceEvent};
use shared_event_bus::FanoutBus;
use tokio::time::sleep;

use crate::{settings::TestSourceSettings, telemetry::RelayTelemetry};

/// Display name credited for synthetic donations.
pub const TEST_SENDER: &str = "TestRig";

/// Generates synthetic donations at random intervals.
pub struct TestSource {
    settings: TestSourceSettings,
    bus: Arc<FanoutBus<SourceEnvelope>>,
    telemetry: RelayTelemetry,
    paused: AtomicBool,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for TestSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestSource")
            .field("workflow", &self.settings.workflow)
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

impl TestSource {
    /// Creates a source publishing on `bus`.
    #[must_use]
    pub fn new(
        settings: TestSourceSettings,
        bus: Arc<FanoutBus<SourceEnvelope>>,
        telemetry: RelayTelemetry,
    ) -> Self {
        Self::with_rng(settings, bus, telemetry, StdRng::from_entropy())
    }

    /// Creates a source drawing from `rng`.
    #[must_use]
    pub fn with_rng(
        settings: TestSourceSettings,
        bus: Arc<FanoutBus<SourceEnvelope>>,
        telemetry: RelayTelemetry,
        rng: StdRng,
    ) -> Self {
        Self {
            settings,
            bus,
            telemetry,
            paused: AtomicBool::new(false),
            rng: Mutex::new(rng),
        }
    }

    /// Sets the paused flag.
    pub fn pause(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
        self.telemetry
            .print(format!("Test source set paused to: {paused}"));
    }

    /// Flips the paused flag and returns the new value.
    pub fn toggle_pause(&self) -> bool {
        let paused = !self.is_paused();
        self.pause(paused);
        paused
    }

    /// Whether generation is paused.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Draws one round: an amount in `[0, 100)` truncated to cents, published on
    /// a coin flip.
    #[must_use]
    pub fn draw(&self) -> Option<SourceEvent> {
        let mut rng = self.rng.lock();
        let cents = (rng.gen::<f64>() * 10_000.0).floor();
        let amount = cents / 100.0;
        rng.gen_bool(0.5)
            .then(|| SourceEvent::donation(TEST_SENDER, amount, "USD"))
    }

    /// Wait before the next round.
    #[must_use]
    pub fn next_wait(&self) -> Duration {
        let min = self.settings.min_wait_secs.saturating_mul(1_000);
        let max = self
            .settings
            .max_minutes_to_wait
            .saturating_mul(60_000)
            .max(min);
        Duration::from_millis(self.rng.lock().gen_range(min..=max))
    }

    /// Runs one round unless paused; returns whether an event was published.
    pub async fn tick(&self) -> bool {
        if self.is_paused() {
            return false;
        }
        let Some(event) = self.draw() else {
            return false;
        };
        self.telemetry
            .print(format!("Test system generated ${:.2}!", event.amount));
        self.bus
            .publish(SourceEnvelope::new(
                self.settings.workflow.clone(),
                self.telemetry.console().source(),
                event,
            ))
            .await;
        true
    }

    /// Waits for the start delay, then generates events forever.
    pub async fn run(self: Arc<Self>) {
        self.telemetry.print(format!(
            "Starting test simulation in {} seconds...",
            self.settings.start_delay_secs
        ));
        sleep(Duration::from_secs(self.settings.start_delay_secs)).await;
        self.telemetry.print("Simulation starting.");
        loop {
            self.tick().await;
            sleep(self.next_wait()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use shared_event_bus::EventHandler;
    use shared_logging::{ConsoleWriter, MemoryConsole};

    struct Collect(Mutex<Vec<SourceEnvelope>>);

    #[async_trait]
    impl EventHandler<SourceEnvelope> for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        async fn handle(&self, event: SourceEnvelope) {
            self.0.lock().push(event);
        }
    }

    fn source(seed: u64) -> (Arc<TestSource>, Arc<Collect>, Arc<MemoryConsole>) {
        let bus: Arc<FanoutBus<SourceEnvelope>> = Arc::new(FanoutBus::new(8));
        let collect = Arc::new(Collect(Mutex::new(Vec::new())));
        bus.subscribe(collect.clone());
        let console = Arc::new(MemoryConsole::new(64));
        let telemetry = RelayTelemetry::builder("relay", ConsoleWriter::new("test", console.clone()))
            .build()
            .unwrap();
        let settings = TestSourceSettings {
            enabled: true,
            ..TestSourceSettings::default()
        };
        let source = TestSource::with_rng(settings, bus, telemetry, StdRng::seed_from_u64(seed));
        (Arc::new(source), collect, console)
    }

    #[tokio::test]
    async fn draws_are_truncated_to_cents_and_credit_test_rig() {
        let (source, _collect, _console) = source(21);
        let drawn: Vec<_> = (0..200).filter_map(|_| source.draw()).collect();
        assert!(drawn.len() > 50 && drawn.len() < 150, "{}", drawn.len());
        for event in drawn {
            assert_eq!(event.name, TEST_SENDER);
            assert!((0.0..100.0).contains(&event.amount));
            let cents = event.amount * 100.0;
            assert!((cents - cents.round()).abs() < 1e-6);
        }
    }

    #[tokio::test]
    async fn waits_stay_within_configured_window() {
        let (source, _collect, _console) = source(5);
        for _ in 0..200 {
            let wait = source.next_wait();
            assert!(wait >= Duration::from_secs(10) && wait <= Duration::from_secs(60));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn paused_source_publishes_nothing() {
        let (source, collect, console) = source(2);
        assert!(source.toggle_pause());
        for _ in 0..20 {
            assert!(!source.tick().await);
        }
        assert!(console.contains("Test source set paused to: true"));

        source.pause(false);
        let mut published = 0;
        for _ in 0..20 {
            if source.tick().await {
                published += 1;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        let seen = collect.0.lock();
        assert_eq!(seen.len(), published);
        assert!(seen.iter().all(|envelope| envelope.workflow == "test"));
        assert!(seen.iter().all(|envelope| envelope.source == "test"));
    }
}
