//! ESP-IDF bus implementations.
//!
//! Binds the probe capability traits to the real peripherals: the RMT
//! one-wire bus with DS18B20 device slots, the shared SPI host with one
//! MAX31865 per chip-select, and the one-shot ADC. Compiled only for
//! the target; the host uses [`super::sim`].

#![allow(clippy::missing_safety_doc)]

use std::collections::BTreeMap;

use esp_idf_svc::sys::*;
use log::{info, warn};

use super::{max31865, AnalogInput, OneWireBus, ProbeError, RtdBus};

// ---------------------------------------------------------------------------
// One-wire (RMT-backed bus, DS18B20 device handles)
// ---------------------------------------------------------------------------

/// Upper bound on devices returned by one bus walk.
const ONEWIRE_MAX_DEVICES: usize = 10;

pub struct EspOneWire {
    bus: onewire_bus_handle_t,
    devices: BTreeMap<u64, ds18b20_device_handle_t>,
}

// Handles are only touched from the read loop or under the pause latch.
unsafe impl Send for EspOneWire {}

impl EspOneWire {
    /// Install the one-wire bus on `gpio`.
    pub fn install(gpio: i32) -> Result<Self, ProbeError> {
        let bus_config = onewire_bus_config_t {
            bus_gpio_num: gpio,
            ..Default::default()
        };
        // 1 byte ROM command + 8 byte ROM number + 1 byte device command.
        let rmt_config = onewire_bus_rmt_config_t { max_rx_bytes: 10 };

        let mut bus: onewire_bus_handle_t = core::ptr::null_mut();
        let ret = unsafe { onewire_new_bus_rmt(&bus_config, &rmt_config, &mut bus) };
        if ret != ESP_OK {
            warn!("one-wire bus install failed on GPIO{gpio} ({ret})");
            return Err(ProbeError::Uninitialized);
        }
        info!("one-wire bus installed on GPIO{gpio}");
        Ok(Self {
            bus,
            devices: BTreeMap::new(),
        })
    }
}

impl OneWireBus for EspOneWire {
    fn search(&mut self) -> Result<Vec<u64>, ProbeError> {
        let mut iter: onewire_device_iter_handle_t = core::ptr::null_mut();
        if unsafe { onewire_new_device_iter(self.bus, &mut iter) } != ESP_OK {
            return Err(ProbeError::HardwareFault);
        }

        let mut found = Vec::new();
        while found.len() < ONEWIRE_MAX_DEVICES {
            let mut device = onewire_device_t::default();
            let ret = unsafe { onewire_device_iter_get_next(iter, &mut device) };
            if ret != ESP_OK {
                break;
            }
            found.push(device.address);
        }
        unsafe { onewire_del_device_iter(iter) };
        Ok(found)
    }

    fn attach(&mut self, rom: u64) -> Result<(), ProbeError> {
        if self.devices.contains_key(&rom) {
            return Ok(());
        }
        let device = onewire_device_t {
            bus: self.bus,
            address: rom,
        };
        let config = ds18b20_config_t::default();
        let mut handle: ds18b20_device_handle_t = core::ptr::null_mut();
        if unsafe { ds18b20_new_device(&device, &config, &mut handle) } != ESP_OK {
            return Err(ProbeError::Disconnected);
        }
        unsafe { ds18b20_set_resolution(handle, ds18b20_resolution_t_DS18B20_RESOLUTION_12B) };
        self.devices.insert(rom, handle);
        Ok(())
    }

    fn release(&mut self, rom: u64) {
        if let Some(handle) = self.devices.remove(&rom) {
            unsafe { ds18b20_del_device(handle) };
        }
    }

    fn measure(&mut self, rom: u64) -> Result<f32, ProbeError> {
        let handle = *self.devices.get(&rom).ok_or(ProbeError::Uninitialized)?;
        if unsafe { ds18b20_trigger_temperature_conversion(handle) } != ESP_OK {
            return Err(ProbeError::Disconnected);
        }
        let mut celsius: f32 = 0.0;
        if unsafe { ds18b20_get_temperature(handle, &mut celsius) } != ESP_OK {
            return Err(ProbeError::Disconnected);
        }
        Ok(celsius)
    }
}

impl Drop for EspOneWire {
    fn drop(&mut self) {
        for (_, handle) in core::mem::take(&mut self.devices) {
            unsafe { ds18b20_del_device(handle) };
        }
        unsafe { onewire_bus_del(self.bus) };
    }
}

// ---------------------------------------------------------------------------
// SPI host shared by MAX31865 converters
// ---------------------------------------------------------------------------

pub struct EspRtdBus {
    host: spi_host_device_t,
    devices: BTreeMap<i32, spi_device_handle_t>,
}

unsafe impl Send for EspRtdBus {}

impl EspRtdBus {
    /// Initialise the SPI host for the converter chain.
    pub fn install(mosi: i32, miso: i32, clk: i32) -> Result<Self, ProbeError> {
        let host = spi_host_device_t_SPI2_HOST;
        let bus_config = spi_bus_config_t {
            __bindgen_anon_1: spi_bus_config_t__bindgen_ty_1 { mosi_io_num: mosi },
            __bindgen_anon_2: spi_bus_config_t__bindgen_ty_2 { miso_io_num: miso },
            sclk_io_num: clk,
            __bindgen_anon_3: spi_bus_config_t__bindgen_ty_3 { quadwp_io_num: -1 },
            __bindgen_anon_4: spi_bus_config_t__bindgen_ty_4 { quadhd_io_num: -1 },
            max_transfer_sz: 4096,
            ..Default::default()
        };
        let ret = unsafe { spi_bus_initialize(host, &bus_config, spi_common_dma_t_SPI_DMA_CH_AUTO) };
        if ret != ESP_OK && ret != ESP_ERR_INVALID_STATE {
            warn!("SPI bus init failed ({ret})");
            return Err(ProbeError::Uninitialized);
        }
        info!("SPI bus initialised for RTD probes");
        Ok(Self {
            host,
            devices: BTreeMap::new(),
        })
    }

    fn transfer(&mut self, cs_pin: i32, tx: &[u8], rx: &mut [u8]) -> Result<(), ProbeError> {
        let handle = *self.devices.get(&cs_pin).ok_or(ProbeError::Uninitialized)?;
        let mut transaction = spi_transaction_t {
            length: (tx.len() * 8),
            __bindgen_anon_1: spi_transaction_t__bindgen_ty_1 {
                tx_buffer: tx.as_ptr() as *const _,
            },
            __bindgen_anon_2: spi_transaction_t__bindgen_ty_2 {
                rx_buffer: rx.as_mut_ptr() as *mut _,
            },
            ..Default::default()
        };
        if unsafe { spi_device_transmit(handle, &mut transaction) } != ESP_OK {
            return Err(ProbeError::HardwareFault);
        }
        Ok(())
    }

    fn write_reg(&mut self, cs_pin: i32, reg: u8, value: u8) -> Result<(), ProbeError> {
        let tx = [0x80 | reg, value];
        let mut rx = [0u8; 2];
        self.transfer(cs_pin, &tx, &mut rx)
    }

    fn read_reg(&mut self, cs_pin: i32, reg: u8) -> Result<u8, ProbeError> {
        let tx = [reg, 0x00];
        let mut rx = [0u8; 2];
        self.transfer(cs_pin, &tx, &mut rx)?;
        Ok(rx[1])
    }

    fn read_reg16(&mut self, cs_pin: i32, reg: u8) -> Result<u16, ProbeError> {
        let tx = [reg, 0x00, 0x00];
        let mut rx = [0u8; 3];
        self.transfer(cs_pin, &tx, &mut rx)?;
        Ok(u16::from(rx[1]) << 8 | u16::from(rx[2]))
    }
}

impl RtdBus for EspRtdBus {
    fn attach(&mut self, cs_pin: i32) -> Result<(), ProbeError> {
        if self.devices.contains_key(&cs_pin) {
            return Ok(());
        }
        let device_config = spi_device_interface_config_t {
            clock_speed_hz: 1_000_000,
            mode: 1,
            spics_io_num: cs_pin,
            queue_size: 1,
            ..Default::default()
        };
        let mut handle: spi_device_handle_t = core::ptr::null_mut();
        if unsafe { spi_bus_add_device(self.host, &device_config, &mut handle) } != ESP_OK {
            warn!("adding RTD device on CS{cs_pin} failed");
            return Err(ProbeError::Uninitialized);
        }
        self.devices.insert(cs_pin, handle);

        // Bias on, automatic conversion, 50 Hz filter.
        self.write_reg(
            cs_pin,
            max31865::REG_CONFIG,
            max31865::CONFIG_BIAS | max31865::CONFIG_MODE_AUTO | max31865::CONFIG_FILTER_50HZ,
        )
    }

    fn detach(&mut self, cs_pin: i32) {
        if let Some(handle) = self.devices.remove(&cs_pin) {
            unsafe { spi_bus_remove_device(handle) };
        }
    }

    fn read_rtd(&mut self, cs_pin: i32) -> Result<u16, ProbeError> {
        self.read_reg16(cs_pin, max31865::REG_RTD_MSB)
    }

    fn read_fault(&mut self, cs_pin: i32) -> Result<u8, ProbeError> {
        self.read_reg(cs_pin, max31865::REG_FAULT_STATUS)
    }

    fn clear_fault(&mut self, cs_pin: i32) -> Result<(), ProbeError> {
        let config =
            max31865::CONFIG_BIAS | max31865::CONFIG_MODE_AUTO | max31865::CONFIG_FILTER_50HZ;
        self.write_reg(cs_pin, max31865::REG_CONFIG, config | max31865::CONFIG_FAULT_CLEAR)?;
        self.write_reg(cs_pin, max31865::REG_CONFIG, config)
    }
}

impl Drop for EspRtdBus {
    fn drop(&mut self) {
        for (_, handle) in core::mem::take(&mut self.devices) {
            unsafe { spi_bus_remove_device(handle) };
        }
        unsafe { spi_bus_free(self.host) };
    }
}

// ---------------------------------------------------------------------------
// One-shot ADC
// ---------------------------------------------------------------------------

pub struct EspAdc {
    unit: adc_oneshot_unit_handle_t,
    cali: adc_cali_handle_t,
    channels: BTreeMap<i32, adc_channel_t>,
}

unsafe impl Send for EspAdc {}

impl EspAdc {
    pub fn install() -> Result<Self, ProbeError> {
        let unit_config = adc_oneshot_unit_init_cfg_t {
            unit_id: adc_unit_t_ADC_UNIT_1,
            ..Default::default()
        };
        let mut unit: adc_oneshot_unit_handle_t = core::ptr::null_mut();
        if unsafe { adc_oneshot_new_unit(&unit_config, &mut unit) } != ESP_OK {
            return Err(ProbeError::Uninitialized);
        }

        // Prefer hardware calibration; fall back to the linear estimate
        // in read_millivolts when the fuses are not burned.
        let cali_config = adc_cali_line_fitting_config_t {
            unit_id: adc_unit_t_ADC_UNIT_1,
            atten: adc_atten_t_ADC_ATTEN_DB_12,
            bitwidth: adc_bitwidth_t_ADC_BITWIDTH_12,
            ..Default::default()
        };
        let mut cali: adc_cali_handle_t = core::ptr::null_mut();
        let have_cali =
            unsafe { adc_cali_create_scheme_line_fitting(&cali_config, &mut cali) } == ESP_OK;
        if !have_cali {
            cali = core::ptr::null_mut();
            warn!("ADC calibration unavailable, using linear conversion");
        }

        Ok(Self {
            unit,
            cali,
            channels: BTreeMap::new(),
        })
    }
}

impl AnalogInput for EspAdc {
    fn configure(&mut self, pin: i32) -> Result<(), ProbeError> {
        let mut channel: adc_channel_t = 0;
        let mut unit_id: adc_unit_t = 0;
        if unsafe { adc_oneshot_io_to_channel(pin, &mut unit_id, &mut channel) } != ESP_OK {
            return Err(ProbeError::Uninitialized);
        }
        let channel_config = adc_oneshot_chan_cfg_t {
            atten: adc_atten_t_ADC_ATTEN_DB_12,
            bitwidth: adc_bitwidth_t_ADC_BITWIDTH_12,
        };
        if unsafe { adc_oneshot_config_channel(self.unit, channel, &channel_config) } != ESP_OK {
            return Err(ProbeError::Uninitialized);
        }
        self.channels.insert(pin, channel);
        Ok(())
    }

    fn read_millivolts(&mut self, pin: i32) -> Result<f32, ProbeError> {
        let channel = *self.channels.get(&pin).ok_or(ProbeError::Uninitialized)?;
        let mut raw: i32 = 0;
        if unsafe { adc_oneshot_read(self.unit, channel, &mut raw) } != ESP_OK {
            return Err(ProbeError::HardwareFault);
        }
        if !self.cali.is_null() {
            let mut mv: i32 = 0;
            if unsafe { adc_cali_raw_to_voltage(self.cali, raw, &mut mv) } == ESP_OK {
                return Ok(mv as f32);
            }
        }
        Ok(super::ntc::counts_to_millivolts(raw as u16))
    }
}

impl Drop for EspAdc {
    fn drop(&mut self) {
        if !self.cali.is_null() {
            unsafe { adc_cali_delete_scheme_line_fitting(self.cali) };
        }
        unsafe { adc_oneshot_del_unit(self.unit) };
    }
}
