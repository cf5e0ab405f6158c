// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Optical density sensor: a laser on an I/O expander pin shining
//! through the vial onto a photodiode read by the ADC.

use std::any::Any;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::trace;

use rfx_core::device::{guarded, DeviceFuture};
use rfx_core::driver::{AdcInput, Driver, IoExpander};
use rfx_core::registry::{CommandArgs, CommandRegistry, CommandsInfo, HandlerFuture};
use rfx_core::sync::lock;
use rfx_core::{Device, DeviceCore, DeviceState, DynResult};

use super::require_connected;

/// Four parameter logistic mapping photodiode signal (mV) to OD.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogisticCurve {
    /// Asymptote as the signal goes to infinity.
    pub a: f64,
    /// Hill coefficient.
    pub b: f64,
    /// Inflection point.
    pub c: f64,
    /// Asymptote as the signal goes to zero.
    pub d: f64,
    /// Rate of change.
    pub g: f64,
}

impl Default for LogisticCurve {
    fn default() -> Self {
        Self {
            a: 4.922604096995577,
            b: 0.9064619103638237,
            c: 19.999999999969816,
            d: -0.49999999999999994,
            g: 2.286809580704199,
        }
    }
}

impl LogisticCurve {
    pub fn od(&self, signal_mv: f64) -> f64 {
        let x = signal_mv.max(0.0);
        self.d + (self.a - self.d) / (1.0 + (x / self.c).powf(self.b)).powf(self.g)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Reading {
    signal_mv: Option<f64>,
    od: Option<f64>,
}

pub struct OdSensor {
    core: DeviceCore,
    laser: Arc<dyn IoExpander>,
    photodiode: Arc<dyn AdcInput>,
    laser_pin: u8,
    adc_channel: u8,
    laser_settle: Duration,
    curve: LogisticCurve,
    reading: Mutex<Reading>,
    registry: CommandRegistry<OdSensor>,
}

impl OdSensor {
    pub fn new(
        name: impl Into<String>,
        laser: Arc<dyn IoExpander>,
        laser_pin: u8,
        photodiode: Arc<dyn AdcInput>,
        adc_channel: u8,
        laser_settle: Duration,
    ) -> Self {
        Self {
            core: DeviceCore::new(name),
            laser,
            photodiode,
            laser_pin,
            adc_channel,
            laser_settle,
            curve: LogisticCurve::default(),
            reading: Mutex::new(Reading::default()),
            registry: CommandRegistry::new().register_validated(
                "measure_od",
                &[],
                require_connected::<OdSensor>,
                measure_od_cmd,
            ),
        }
    }

    pub fn with_curve(mut self, curve: LogisticCurve) -> Self {
        self.curve = curve;
        self
    }

    pub fn od(&self) -> Option<f64> {
        lock(&self.reading).od
    }

    pub fn signal(&self) -> Option<f64> {
        lock(&self.reading).signal_mv
    }

    /// The laser is active low.
    async fn laser_on(&self, on: bool) -> DynResult<()> {
        self.laser.write_pin(self.laser_pin, !on).await
    }

    /// Returns (background, transmitted) in mV.
    async fn sample(&self) -> DynResult<(f64, f64)> {
        let background = self.photodiode.read_millivolts(self.adc_channel).await?;
        self.laser_on(true).await?;
        tokio::time::sleep(self.laser_settle).await;
        let transmitted = self.photodiode.read_millivolts(self.adc_channel).await;
        self.laser_on(false).await?;
        Ok((background, transmitted?))
    }

    pub async fn measure_od(&self) -> DynResult<f64> {
        self.set_state(DeviceState::Working);
        let (background, transmitted) = guarded(self, self.sample()).await?;
        let signal = transmitted - background;
        let od = self.curve.od(signal);
        trace!("{}: signal {:.3} mV -> od {:.4}", self.id(), signal, od);
        *lock(&self.reading) = Reading {
            signal_mv: Some(signal),
            od: Some(od),
        };
        self.set_state(DeviceState::Operational);
        Ok(od)
    }
}

fn measure_od_cmd<'a>(sensor: &'a OdSensor, _args: &'a CommandArgs) -> HandlerFuture<'a> {
    Box::pin(async move { Ok(json!(sensor.measure_od().await?)) })
}

impl Device for OdSensor {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn reset_state(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move { self.laser_on(false).await })
    }

    fn read_state(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            self.measure_od().await?;
            Ok(())
        })
    }

    fn probe(&self) -> DeviceFuture<'_, ()> {
        Box::pin(async move {
            let (dark, lit) = self.sample().await?;
            if dark == lit {
                return Err(format!("{}: laser has no effect on photodiode ({} mV)", self.id(), dark).into());
            }
            Ok(())
        })
    }

    fn drivers(&self) -> Vec<Arc<dyn Driver>> {
        vec![
            self.laser.clone() as Arc<dyn Driver>,
            self.photodiode.clone() as Arc<dyn Driver>,
        ]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn get_state_string(&self) -> String {
        match self.state() {
            DeviceState::Working => "Measuring".to_string(),
            other => other.label().to_string(),
        }
    }

    fn extra_data(&self) -> Map<String, Value> {
        let reading = *lock(&self.reading);
        let mut extra = Map::new();
        extra.insert("value".to_string(), json!(reading.od));
        extra.insert("signal".to_string(), json!(reading.signal_mv));
        extra
    }

    fn commands_info(&self) -> CommandsInfo {
        self.registry.info()
    }

    fn execute<'a>(&'a self, command: &'a str, args: &'a CommandArgs) -> DeviceFuture<'a, Value> {
        self.registry.dispatch(self, command, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::testing::TestBoard;
    use rfx_backend::board::{BoardLayout, ADC_CHIP_SELECT};
    use rfx_core::transport::BusKind;

    fn sensor(board: &TestBoard, vial: u8) -> OdSensor {
        let channel = BoardLayout::optics_channel(vial);
        OdSensor::new(
            format!("OD sensor {vial}"),
            board.board.io_expander(),
            channel,
            board.board.adc_input(),
            channel,
            Duration::from_millis(1),
        )
    }

    #[test]
    fn test_curve_is_decreasing() {
        let curve = LogisticCurve::default();
        assert!((curve.od(0.0) - curve.a).abs() < 1e-9);
        assert!(curve.od(10.0) > curve.od(50.0));
        assert!(curve.od(1e6) > curve.d);
        assert_eq!(curve.od(-5.0), curve.od(0.0));
    }

    #[tokio::test]
    async fn test_measure_subtracts_background() {
        let board = TestBoard::connected().await;
        board.bridge.couple_optics(BoardLayout::optics_channel(2), BoardLayout::optics_channel(2), 10.0, 30.0);
        let sensor = sensor(&board, 2);
        sensor.connect().await.unwrap();

        let od = sensor.measure_od().await.unwrap();
        assert_eq!(sensor.signal(), Some(20.0));
        assert!((od - LogisticCurve::default().od(20.0)).abs() < 1e-9);
        assert_eq!(sensor.state(), DeviceState::Operational);
        // laser back off
        assert!(board.board.io_expander().read_pin(BoardLayout::optics_channel(2)).await.unwrap());
    }

    #[tokio::test]
    async fn test_dead_laser_fails_self_test() {
        let board = TestBoard::connected().await;
        board.bridge.couple_optics(BoardLayout::optics_channel(4), BoardLayout::optics_channel(4), 8.0, 8.0);
        let sensor = sensor(&board, 4);
        assert!(!sensor.test().await);
        assert_eq!(sensor.state(), DeviceState::Error);
    }

    #[tokio::test]
    async fn test_adc_nack_reported() {
        let board = TestBoard::connected().await;
        let sensor = sensor(&board, 1);
        sensor.connect().await.unwrap();
        board.bridge.set_nack(BusKind::Spi, ADC_CHIP_SELECT, true);
        assert!(sensor.execute("measure_od", &CommandArgs::new()).await.is_err());
        assert_eq!(sensor.state(), DeviceState::Error);
        assert_eq!(sensor.error(), "spi:8: not acknowledged (NACK)");
    }
}
