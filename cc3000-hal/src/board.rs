use crate::{Error, Result};

/// Where the CC3000 is wired up on a known board.
///
/// Pins are given as the board's digital pin numbers. Looking up the profile happens before
/// [init](crate::init), which then gets the pins the HAL of the board hands out for these numbers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BoardProfile {
    pub name: &'static str,
    /// Index of the SPI peripheral.
    pub spi: u8,
    pub chip_select: u8,
    pub wlan_enable: u8,
    pub irq: u8,
}
impl BoardProfile {
    /// The Adafruit CC3000 shield on an Arduino Uno style header.
    pub const ARDUINO_UNO: Self = Self {
        name: "arduino_uno",
        spi: 0,
        chip_select: 10,
        wlan_enable: 5,
        irq: 3,
    };
    /// The Particle (Spark) Core, which has the CC3000 on board.
    pub const PARTICLE_CORE: Self = Self {
        name: "particle_core",
        spi: 1,
        chip_select: 13,
        wlan_enable: 11,
        irq: 12,
    };
    /// Every board we know about.
    pub const ALL: &'static [Self] = &[Self::ARDUINO_UNO, Self::PARTICLE_CORE];

    /// Find the profile for a board.
    ///
    /// Returns [Error::Unsupported] for unknown layouts.
    pub fn lookup(name: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .find(|profile| profile.name == name)
            .copied()
            .ok_or(Error::Unsupported)
    }
}
