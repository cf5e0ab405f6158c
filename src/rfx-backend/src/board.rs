// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Bioreactor board address map and driver assembly.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use rfx_core::driver::{AdcInput, Driver, IoExpander, PwmOutput, StepperMotor, TemperatureSensor};
use rfx_core::transport::{Bridge, BusKind};

use crate::drivers::{RegisterAdc, RegisterIo, RegisterPwm, RegisterStepper, RegisterThermometer};

pub const PWM_ADDRESS: u8 = 0x40;
pub const LASER_IO_ADDRESS: u8 = 0x20;
pub const THERMOMETER_BASE_ADDRESS: u8 = 0x48;
pub const ADC_CHIP_SELECT: u8 = 8;
pub const STIRRER_CHANNEL_OFFSET: u8 = 8;

pub const MAX_VIALS: u8 = 8;
pub const MAX_PUMPS: u8 = 8;

/// Number of each unit fitted on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardLayout {
    pub pumps: u8,
    pub vials: u8,
    pub thermometers: u8,
}

impl Default for BoardLayout {
    fn default() -> Self {
        Self {
            pumps: 4,
            vials: 7,
            thermometers: 2,
        }
    }
}

impl BoardLayout {
    pub fn validate(&self) -> Result<(), String> {
        if self.vials == 0 || self.vials > MAX_VIALS {
            return Err(format!("vials must be in 1..={}, got {}", MAX_VIALS, self.vials));
        }
        if self.pumps == 0 || self.pumps > MAX_PUMPS {
            return Err(format!("pumps must be in 1..={}, got {}", MAX_PUMPS, self.pumps));
        }
        Ok(())
    }

    /// PWM channel of the valve for a 1-based vial number.
    pub fn valve_channel(vial: u8) -> u8 {
        vial.saturating_sub(1)
    }

    pub fn stirrer_channel(vial: u8) -> u8 {
        STIRRER_CHANNEL_OFFSET + vial.saturating_sub(1)
    }

    /// Laser pin and photodiode ADC channel for a vial.
    pub fn optics_channel(vial: u8) -> u8 {
        vial.saturating_sub(1)
    }

    pub fn stepper_chip_select(pump: u8) -> u8 {
        pump.saturating_sub(1)
    }

    pub fn thermometer_address(index: u8) -> u8 {
        THERMOMETER_BASE_ADDRESS + index
    }
}

/// Drivers of one board, in initialization order.
pub struct Board {
    pub bridge: Arc<dyn Bridge>,
    pub pwm: Arc<RegisterPwm>,
    pub laser_io: Arc<RegisterIo>,
    pub adc: Arc<RegisterAdc>,
    pub steppers: Vec<Arc<RegisterStepper>>,
    pub thermometers: Vec<Arc<RegisterThermometer>>,
}

impl Board {
    pub fn build(bridge: Arc<dyn Bridge>, layout: &BoardLayout) -> Self {
        let pwm = Arc::new(RegisterPwm::new(
            "pwm",
            bridge.port(BusKind::I2c, PWM_ADDRESS),
        ));
        let laser_io = Arc::new(RegisterIo::new(
            "laser-io",
            bridge.port(BusKind::I2c, LASER_IO_ADDRESS),
        ));
        let adc = Arc::new(RegisterAdc::new(
            "photodiode-adc",
            bridge.port(BusKind::Spi, ADC_CHIP_SELECT),
        ));
        let steppers = (1..=layout.pumps)
            .map(|pump| {
                Arc::new(RegisterStepper::new(
                    format!("stepper-{pump}"),
                    bridge.port(BusKind::Spi, BoardLayout::stepper_chip_select(pump)),
                ))
            })
            .collect();
        let thermometers = (0..layout.thermometers)
            .map(|index| {
                Arc::new(RegisterThermometer::new(
                    format!("thermometer-{}", index + 1),
                    bridge.port(BusKind::I2c, BoardLayout::thermometer_address(index)),
                ))
            })
            .collect();
        Self {
            bridge,
            pwm,
            laser_io,
            adc,
            steppers,
            thermometers,
        }
    }

    pub fn pwm_output(&self) -> Arc<dyn PwmOutput> {
        self.pwm.clone()
    }

    pub fn io_expander(&self) -> Arc<dyn IoExpander> {
        self.laser_io.clone()
    }

    pub fn adc_input(&self) -> Arc<dyn AdcInput> {
        self.adc.clone()
    }

    pub fn stepper(&self, pump: u8) -> Option<Arc<dyn StepperMotor>> {
        let index = usize::from(pump.checked_sub(1)?);
        self.steppers
            .get(index)
            .map(|s| s.clone() as Arc<dyn StepperMotor>)
    }

    pub fn thermometer(&self, index: usize) -> Option<Arc<dyn TemperatureSensor>> {
        self.thermometers
            .get(index)
            .map(|t| t.clone() as Arc<dyn TemperatureSensor>)
    }

    /// Every driver, in the order they must be initialized.
    pub fn drivers(&self) -> Vec<Arc<dyn Driver>> {
        let mut drivers: Vec<Arc<dyn Driver>> = vec![
            self.pwm.clone() as Arc<dyn Driver>,
            self.laser_io.clone() as Arc<dyn Driver>,
            self.adc.clone() as Arc<dyn Driver>,
        ];
        drivers.extend(self.steppers.iter().map(|s| s.clone() as Arc<dyn Driver>));
        drivers.extend(self.thermometers.iter().map(|t| t.clone() as Arc<dyn Driver>));
        drivers
    }
}
