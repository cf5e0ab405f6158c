// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Virtual USB bridge for development and testing.
//!
//! Keeps every chip's registers in memory, so no hardware is needed.
//! Tests can plug and unplug the bridge, force NACKs on a port and
//! couple a laser pin to a photodiode channel to emulate the optics.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use rfx_core::sync::lock;
use rfx_core::transport::{
    Bridge, BusKind, BusSession, HardwarePort, PortError, PortFuture, UsbDeviceInfo,
};
use rfx_core::{BoxFuture, DynResult};

use crate::board::{BoardLayout, ADC_CHIP_SELECT, LASER_IO_ADDRESS};
use crate::drivers::{RegisterThermometer, REG_OUTPUT};

pub const FTDI_VENDOR_ID: u16 = 0x0403;
pub const FT232H_PRODUCT_ID: u16 = 0x6014;

const DEFAULT_TEMPERATURE_C: f64 = 37.0;
const DEFAULT_DARK_MV: f32 = 4.0;
const DEFAULT_LIT_MV: f32 = 120.0;

type PortKey = (BusKind, u8);

#[derive(Debug, Clone, Copy)]
struct OpticalPath {
    adc: PortKey,
    channel: u8,
    laser: PortKey,
    pin: u8,
    dark_mv: f32,
    lit_mv: f32,
}

#[derive(Debug, Default)]
struct SimState {
    visible: Vec<UsbDeviceInfo>,
    open: Option<UsbDeviceInfo>,
    registers: HashMap<PortKey, HashMap<u8, Vec<u8>>>,
    last_written: HashMap<PortKey, Vec<u8>>,
    nack: HashSet<PortKey>,
    optics: Vec<OpticalPath>,
    opens: usize,
}

impl SimState {
    fn register(&self, key: PortKey, register: u8) -> Option<&Vec<u8>> {
        self.registers.get(&key).and_then(|regs| regs.get(&register))
    }

    fn write_register(&mut self, key: PortKey, register: u8, data: &[u8]) {
        self.registers
            .entry(key)
            .or_default()
            .insert(register, data.to_vec());
    }

    /// Laser pins are active low.
    fn laser_on(&self, path: &OpticalPath) -> bool {
        let levels = self
            .register(path.laser, REG_OUTPUT)
            .filter(|b| b.len() >= 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .unwrap_or(u16::MAX);
        levels & (1 << path.pin) == 0
    }

    fn read_register(&self, key: PortKey, register: u8, len: usize) -> Vec<u8> {
        let optical = self
            .optics
            .iter()
            .find(|p| p.adc == key && p.channel == register);
        if let Some(path) = optical {
            let mv = if self.laser_on(path) {
                path.lit_mv
            } else {
                path.dark_mv
            };
            return fit(mv.to_be_bytes().to_vec(), len);
        }
        fit(self.register(key, register).cloned().unwrap_or_default(), len)
    }
}

fn fit(mut bytes: Vec<u8>, len: usize) -> Vec<u8> {
    bytes.resize(len, 0);
    bytes
}

pub struct VirtualBridge {
    name: String,
    session: Arc<BusSession>,
    sim: Arc<Mutex<SimState>>,
}

impl Default for VirtualBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualBridge {
    /// A bridge with nothing plugged in.
    pub fn new() -> Self {
        Self {
            name: "virtual".to_string(),
            session: Arc::new(BusSession::new()),
            sim: Arc::new(Mutex::new(SimState::default())),
        }
    }

    /// A bridge with one device of the given serial plugged in.
    pub fn with_serial(serial: &str) -> Self {
        let bridge = Self::new();
        bridge.plug(Self::device_info(serial));
        bridge
    }

    pub fn device_info(serial: &str) -> UsbDeviceInfo {
        UsbDeviceInfo {
            id: format!("virtual:{serial}"),
            vendor_id: FTDI_VENDOR_ID,
            product_id: FT232H_PRODUCT_ID,
            serial_number: Some(serial.to_string()),
            manufacturer: Some("FTDI".to_string()),
            product: Some("Virtual FT232H".to_string()),
        }
    }

    pub fn plug(&self, device: UsbDeviceInfo) {
        let mut sim = lock(&self.sim);
        if !sim.visible.iter().any(|d| d.id == device.id) {
            debug!("virtual bridge: plugged {}", device.id);
            sim.visible.push(device);
        }
    }

    /// Remove a device, dropping the open session if it was in use.
    pub fn unplug(&self, serial: &str) -> Option<UsbDeviceInfo> {
        let mut sim = lock(&self.sim);
        let index = sim
            .visible
            .iter()
            .position(|d| d.matches_serial(Some(serial)))?;
        let device = sim.visible.remove(index);
        if sim.open.as_ref().is_some_and(|open| open.id == device.id) {
            sim.open = None;
        }
        debug!("virtual bridge: unplugged {}", device.id);
        Some(device)
    }

    pub fn set_nack(&self, bus: BusKind, address: u8, enabled: bool) {
        let mut sim = lock(&self.sim);
        if enabled {
            sim.nack.insert((bus, address));
        } else {
            sim.nack.remove(&(bus, address));
        }
    }

    /// Write a register as the chip itself would.
    pub fn poke(&self, bus: BusKind, address: u8, register: u8, data: &[u8]) {
        lock(&self.sim).write_register((bus, address), register, data);
    }

    pub fn peek(&self, bus: BusKind, address: u8, register: u8) -> Option<Vec<u8>> {
        lock(&self.sim).register((bus, address), register).cloned()
    }

    pub fn couple_optics(&self, channel: u8, pin: u8, dark_mv: f32, lit_mv: f32) {
        let path = OpticalPath {
            adc: (BusKind::Spi, ADC_CHIP_SELECT),
            channel,
            laser: (BusKind::I2c, LASER_IO_ADDRESS),
            pin,
            dark_mv,
            lit_mv,
        };
        let mut sim = lock(&self.sim);
        sim.optics.retain(|p| !(p.adc == path.adc && p.channel == channel));
        sim.optics.push(path);
    }

    /// Populate sensors so a fresh board reads plausible values.
    pub fn seed_board(&self, layout: &BoardLayout) {
        for index in 0..layout.thermometers {
            self.poke(
                BusKind::I2c,
                BoardLayout::thermometer_address(index),
                REG_OUTPUT,
                &RegisterThermometer::encode(DEFAULT_TEMPERATURE_C),
            );
        }
        for vial in 1..=layout.vials {
            let channel = BoardLayout::optics_channel(vial);
            self.couple_optics(channel, channel, DEFAULT_DARK_MV, DEFAULT_LIT_MV);
        }
    }

    pub fn open_count(&self) -> usize {
        lock(&self.sim).opens
    }

    fn make_port(&self, bus: BusKind, address: u8) -> VirtualPort {
        let name = match bus {
            BusKind::Spi => format!("spi:{address}"),
            BusKind::I2c => format!("i2c:0x{address:02x}"),
        };
        VirtualPort {
            name,
            key: (bus, address),
            sim: self.sim.clone(),
            session: self.session.clone(),
        }
    }
}

impl Bridge for VirtualBridge {
    fn name(&self) -> &str {
        &self.name
    }

    fn open<'a>(&'a self, device: &'a UsbDeviceInfo) -> BoxFuture<'a, DynResult<()>> {
        Box::pin(async move {
            let _session = self.session.acquire().await;
            let mut sim = lock(&self.sim);
            if !sim.visible.iter().any(|d| d.id == device.id) {
                return Err(format!("device {} is not attached", device.id).into());
            }
            sim.open = Some(device.clone());
            sim.opens += 1;
            info!("virtual bridge: opened {}", device.id);
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, DynResult<()>> {
        Box::pin(async move {
            let _session = self.session.acquire().await;
            if let Some(device) = lock(&self.sim).open.take() {
                info!("virtual bridge: closed {}", device.id);
            }
            Ok(())
        })
    }

    fn is_connected(&self) -> bool {
        lock(&self.sim).open.is_some()
    }

    fn device(&self) -> Option<UsbDeviceInfo> {
        lock(&self.sim).open.clone()
    }

    fn session(&self) -> Arc<BusSession> {
        self.session.clone()
    }

    fn port(&self, bus: BusKind, address: u8) -> Arc<dyn HardwarePort> {
        Arc::new(self.make_port(bus, address))
    }

    fn enumerate(&self) -> Vec<UsbDeviceInfo> {
        lock(&self.sim).visible.clone()
    }
}

struct VirtualPort {
    name: String,
    key: PortKey,
    sim: Arc<Mutex<SimState>>,
    session: Arc<BusSession>,
}

impl VirtualPort {
    async fn transact<T, F>(&self, op: F) -> Result<T, PortError>
    where
        F: FnOnce(&mut SimState, PortKey) -> T + Send,
    {
        let _session = self.session.acquire().await;
        let mut sim = lock(&self.sim);
        if sim.open.is_none() {
            return Err(PortError::Disconnected {
                port: self.name.clone(),
            });
        }
        if sim.nack.contains(&self.key) {
            return Err(PortError::Nack {
                port: self.name.clone(),
            });
        }
        Ok(op(&mut sim, self.key))
    }
}

impl HardwarePort for VirtualPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self, len: usize) -> PortFuture<'_, Vec<u8>> {
        Box::pin(self.transact(move |sim, key| {
            fit(sim.last_written.get(&key).cloned().unwrap_or_default(), len)
        }))
    }

    fn write<'a>(&'a self, data: &'a [u8]) -> PortFuture<'a, ()> {
        Box::pin(self.transact(move |sim, key| {
            sim.last_written.insert(key, data.to_vec());
        }))
    }

    fn read_from(&self, register: u8, len: usize) -> PortFuture<'_, Vec<u8>> {
        Box::pin(self.transact(move |sim, key| sim.read_register(key, register, len)))
    }

    fn write_to<'a>(&'a self, register: u8, data: &'a [u8]) -> PortFuture<'a, ()> {
        Box::pin(self.transact(move |sim, key| sim.write_register(key, register, data)))
    }

    fn exchange<'a>(&'a self, out: &'a [u8], read_len: usize) -> PortFuture<'a, Vec<u8>> {
        Box::pin(self.transact(move |sim, key| {
            sim.last_written.insert(key, out.to_vec());
            fit(out.to_vec(), read_len)
        }))
    }
}
