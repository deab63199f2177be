//! Firmware entry point.
//!
//! Wires the platform adapters to the engine: settings store, probe
//! buses, GPIO outputs, HTTP server and MQTT sink, then parks the main
//! task while the loops run. On the host the same wiring runs against
//! the simulation backends, which makes `cargo run` a bench-top dry
//! run of the whole engine.

use std::sync::{Arc, Mutex};

use anyhow::Result;
use log::{info, warn};

use brewengine::clock::SystemClock;
use brewengine::config::SystemConfig;
use brewengine::engine::{gpio, BrewEngine, BusHandles};
use brewengine::settings::SettingsStore;

fn main() -> Result<()> {
    #[cfg(target_os = "espidf")]
    {
        esp_idf_svc::sys::link_patches();
        esp_idf_svc::log::EspLogger::initialize_default();
    }
    #[cfg(not(target_os = "espidf"))]
    env_logger::init();

    info!("brewengine v{}", env!("CARGO_PKG_VERSION"));

    let store = SettingsStore::open().map_err(|e| anyhow::anyhow!("settings store: {e}"))?;
    let config = SystemConfig::load(&store);

    let buses = init_buses(&config);
    let outputs = init_outputs();

    // The Wi-Fi collaborator owns the hostname key in its own namespace;
    // fall back to the default station name.
    let hostname = "brewengine".to_string();

    let engine = Arc::new(BrewEngine::new(
        store,
        Arc::new(SystemClock),
        buses,
        outputs,
        &hostname,
        true,
    ));

    // Bind DS18B20 devices that answered on the bus at boot.
    if let Err(e) = engine.detect_sensors() {
        warn!("initial sensor detect failed ({e})");
    }

    engine.spawn_core_tasks();

    #[cfg(target_os = "espidf")]
    let _server = brewengine::transport::http::start(engine.clone())?;

    info!("engine running");
    loop {
        std::thread::sleep(std::time::Duration::from_secs(60));
        if !engine.state.run.load(std::sync::atomic::Ordering::Relaxed) {
            break;
        }
    }
    Ok(())
}

#[cfg(target_os = "espidf")]
fn init_buses(config: &SystemConfig) -> BusHandles {
    use brewengine::probes::hal::{EspAdc, EspOneWire, EspRtdBus};
    use brewengine::probes::{SharedAnalog, SharedOneWire, SharedRtdBus};

    let onewire = match EspOneWire::install(config.onewire_pin) {
        Ok(bus) => Some(Arc::new(Mutex::new(bus)) as SharedOneWire),
        Err(e) => {
            // Continue without the bus; its sensors stay disconnected.
            warn!("one-wire init failed ({e})");
            None
        }
    };
    let rtd = if config.rtd_enabled {
        match EspRtdBus::install(config.spi_mosi_pin, config.spi_miso_pin, config.spi_clk_pin) {
            Ok(bus) => Some(Arc::new(Mutex::new(bus)) as SharedRtdBus),
            Err(e) => {
                warn!("SPI init failed ({e})");
                None
            }
        }
    } else {
        None
    };
    let adc = match EspAdc::install() {
        Ok(bus) => Some(Arc::new(Mutex::new(bus)) as SharedAnalog),
        Err(e) => {
            warn!("ADC init failed ({e})");
            None
        }
    };
    BusHandles { onewire, rtd, adc }
}

#[cfg(not(target_os = "espidf"))]
fn init_buses(_config: &SystemConfig) -> BusHandles {
    use brewengine::probes::sim::{SimAdc, SimOneWire, SimRtdBus};
    use brewengine::probes::{SharedAnalog, SharedOneWire, SharedRtdBus};

    // Bench rig: one simulated DS18B20 sitting at mash-in temperature.
    let onewire = SimOneWire::shared();
    onewire
        .lock()
        .unwrap()
        .set_device(0x28FF_0000_0000_0001, Ok(20.0));

    BusHandles {
        onewire: Some(onewire as SharedOneWire),
        rtd: Some(SimRtdBus::shared() as SharedRtdBus),
        adc: Some(SimAdc::shared() as SharedAnalog),
    }
}

#[cfg(target_os = "espidf")]
fn init_outputs() -> gpio::SharedOutputs {
    Arc::new(Mutex::new(gpio::EspOutputs))
}

#[cfg(not(target_os = "espidf"))]
fn init_outputs() -> gpio::SharedOutputs {
    Arc::new(Mutex::new(gpio::SimOutputs::new()))
}
