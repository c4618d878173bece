//! Simulated radio with one demo peripheral, used when the server runs
//! without a BlueZ adapter.

use std::sync::Arc;
use std::time::Duration;

use blelink_core::radio::sim::{Peripheral, SimulatedRadio};
use blelink_core::TelemetryChannel;
use tokio::task::JoinHandle;
use tracing::debug;

/// Address of the demo peripheral.
pub const DEMO_ADDRESS: &str = "C0:FF:EE:00:00:01";

/// Name the demo peripheral advertises.
pub const DEMO_NAME: &str = "blelink-demo";

const TICK: Duration = Duration::from_secs(1);

/// A simulated radio holding the demo peripheral.
#[must_use]
pub fn radio(telemetry: &TelemetryChannel) -> Arc<SimulatedRadio> {
    let radio = SimulatedRadio::new();
    radio.add_peripheral(
        DEMO_ADDRESS,
        Peripheral::with_telemetry(DEMO_NAME, telemetry)
            .value(telemetry.notify_characteristic, vec![0x00]),
    );
    radio
}

/// Advertise the demo peripheral and push a telemetry counter once a second.
///
/// Advertisements only arrive while a scan runs and notifications only once
/// a connection enabled them.
pub fn spawn_activity(radio: Arc<SimulatedRadio>, telemetry: TelemetryChannel) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(TICK);
        let mut counter: u8 = 0;
        loop {
            interval.tick().await;
            counter = counter.wrapping_add(1);
            let rssi = -55 - i16::from(counter % 8);
            radio.advertise(DEMO_ADDRESS, Some(DEMO_NAME), rssi);
            radio.notify(
                DEMO_ADDRESS,
                telemetry.service,
                telemetry.notify_characteristic,
                &[counter],
            );
            debug!(counter, rssi, "demo tick");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demo_radio_knows_the_peripheral() {
        let radio = radio(&TelemetryChannel::default());
        assert!(!radio.is_scanning());
        assert!(!radio.is_linked(DEMO_ADDRESS));
        assert_eq!(radio.open_attempts(DEMO_ADDRESS), 0);
    }
}
