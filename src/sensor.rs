//! Seismic sensor abstraction for sender nodes.
//!
//! Register-level access to the sensor lives behind [`SeismicSensor`]. Raw
//! register values are sanitised here: `0xFFFF` (bus read failure) and values
//! above the physical ceiling read as 0, out-of-range temperatures as 0.0.
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::errors::QuakeResult;
use crate::protocol::{EarthquakeReading, SeismicEvent};

/// Spectral intensity ceiling.
pub const SI_MAX: u16 = 999;
/// Peak ground acceleration ceiling.
pub const PGA_MAX: u16 = 4000;
/// Number of event blocks the sensor keeps.
pub const EVENT_BLOCKS: usize = 3;

pub fn sanitize_register(v: u16, vmax: u16) -> u16 {
    if v == 0xFFFF || v > vmax {
        0
    } else {
        v
    }
}

pub fn sanitize_temp(t: f32) -> f32 {
    if t.is_nan() || !(-40.0..=85.0).contains(&t) {
        0.0
    } else {
        t
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EventBlock {
    pub si: u16,
    pub pga: u16,
    pub temp: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SensorReading {
    /// Sensor answered its initialisation probe.
    pub active: bool,
    pub si: u16,
    pub pga: u16,
    pub temp: f32,
    pub events: [EventBlock; EVENT_BLOCKS],
}

impl SensorReading {
    /// Build from raw register values.
    pub fn from_registers(active: bool, si: u16, pga: u16, temp_tenths: u16, events: [EventBlock; EVENT_BLOCKS]) -> Self {
        let temp = if temp_tenths == 0xFFFF {
            0.0
        } else {
            sanitize_temp(temp_tenths as f32 / 10.0)
        };
        let events = events.map(|e| EventBlock {
            si: sanitize_register(e.si, SI_MAX),
            pga: sanitize_register(e.pga, PGA_MAX),
            temp: sanitize_temp(e.temp),
        });
        Self {
            active,
            si: sanitize_register(si, SI_MAX),
            pga: sanitize_register(pga, PGA_MAX),
            temp,
            events,
        }
    }

    /// Envelope form. Only significant event blocks are included.
    pub fn to_earthquake(&self, with_events: bool) -> EarthquakeReading {
        let events = if with_events {
            self.events
                .iter()
                .enumerate()
                .map(|(i, e)| SeismicEvent {
                    id: i as u8,
                    si: e.si as f64,
                    pga: e.pga as f64,
                    temp: e.temp as f64,
                })
                .filter(SeismicEvent::is_significant)
                .collect()
        } else {
            Vec::new()
        };
        EarthquakeReading {
            status: if self.active { "active" } else { "offline" }.to_string(),
            si: self.si as f64,
            pga: self.pga as f64,
            temp: (self.temp as f64 * 10.0).round() / 10.0,
            events,
        }
    }
}

pub trait SeismicSensor: Send {
    fn read(&mut self) -> QuakeResult<SensorReading>;
}

/// Background noise with occasional synthetic events.
pub struct SimulatedSensor {
    rng: StdRng,
    event_probability: f64,
    events: [EventBlock; EVENT_BLOCKS],
}

impl SimulatedSensor {
    pub fn new(seed: u64, event_probability: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            event_probability: event_probability.clamp(0.0, 1.0),
            events: [EventBlock::default(); EVENT_BLOCKS],
        }
    }
}

impl SeismicSensor for SimulatedSensor {
    fn read(&mut self) -> QuakeResult<SensorReading> {
        let temp_tenths = self.rng.gen_range(200..300u16);
        let (si, pga) = if self.rng.gen_bool(self.event_probability) {
            let si = self.rng.gen_range(6..120u16);
            let pga = self.rng.gen_range(11..800u16);
            self.events.rotate_right(1);
            self.events[0] = EventBlock {
                si,
                pga,
                temp: temp_tenths as f32 / 10.0,
            };
            (si, pga)
        } else {
            (self.rng.gen_range(0..3u16), self.rng.gen_range(0..6u16))
        };
        Ok(SensorReading::from_registers(true, si, pga, temp_tenths, self.events))
    }
}

/// Always returns the same reading.
#[derive(Debug, Clone, Default)]
pub struct FixedSensor(pub SensorReading);

impl SeismicSensor for FixedSensor {
    fn read(&mut self) -> QuakeResult<SensorReading> {
        Ok(self.0)
    }
}
