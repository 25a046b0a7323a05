use serde::Serialize;
use std::num::ParseFloatError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CrowdLevel {
    Empty,
    Moderate,
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PowerOutlets {
    Excellent,
    Good,
    Fair,
    Poor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NoiseLevel {
    Quiet,
    Moderate,
    Loud,
}

pub trait Choice: Copy + PartialEq + 'static {
    const ALL: &'static [Self];

    fn label(self) -> &'static str;

    fn next(self) -> Self {
        let i = Self::ALL.iter().position(|c| *c == self).unwrap_or(0);
        Self::ALL[(i + 1) % Self::ALL.len()]
    }

    fn prev(self) -> Self {
        let i = Self::ALL.iter().position(|c| *c == self).unwrap_or(0);
        Self::ALL[(i + Self::ALL.len() - 1) % Self::ALL.len()]
    }
}

impl Choice for CrowdLevel {
    const ALL: &'static [Self] = &[CrowdLevel::Empty, CrowdLevel::Moderate, CrowdLevel::Busy];

    fn label(self) -> &'static str {
        match self {
            CrowdLevel::Empty => "Empty",
            CrowdLevel::Moderate => "Moderate",
            CrowdLevel::Busy => "Busy",
        }
    }
}

impl Choice for PowerOutlets {
    const ALL: &'static [Self] = &[
        PowerOutlets::Excellent,
        PowerOutlets::Good,
        PowerOutlets::Fair,
        PowerOutlets::Poor,
    ];

    fn label(self) -> &'static str {
        match self {
            PowerOutlets::Excellent => "Excellent",
            PowerOutlets::Good => "Good",
            PowerOutlets::Fair => "Fair",
            PowerOutlets::Poor => "Poor",
        }
    }
}

impl Choice for NoiseLevel {
    const ALL: &'static [Self] = &[NoiseLevel::Quiet, NoiseLevel::Moderate, NoiseLevel::Loud];

    fn label(self) -> &'static str {
        match self {
            NoiseLevel::Quiet => "Quiet",
            NoiseLevel::Moderate => "Moderate",
            NoiseLevel::Loud => "Loud",
        }
    }
}

fn step_forward<T: Choice>(current: Option<T>) -> T {
    current.map_or(T::ALL[0], Choice::next)
}

fn step_back<T: Choice>(current: Option<T>) -> T {
    current.map_or(T::ALL[T::ALL.len() - 1], Choice::prev)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckInField {
    Crowd,
    Outlets,
    Noise,
}

impl CheckInField {
    pub fn next(self) -> Self {
        match self {
            CheckInField::Crowd => CheckInField::Outlets,
            CheckInField::Outlets => CheckInField::Noise,
            CheckInField::Noise => CheckInField::Crowd,
        }
    }

    pub fn prev(self) -> Self {
        match self {
            CheckInField::Crowd => CheckInField::Noise,
            CheckInField::Outlets => CheckInField::Crowd,
            CheckInField::Noise => CheckInField::Outlets,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckInDraft {
    pub crowd: Option<CrowdLevel>,
    pub outlets: Option<PowerOutlets>,
    pub noise: Option<NoiseLevel>,
    wifi_speed: Option<String>,
}

impl CheckInDraft {
    pub fn wifi_speed(&self) -> Option<&str> {
        self.wifi_speed.as_deref()
    }

    pub fn apply_speed(&mut self, mbps: impl Into<String>) {
        self.wifi_speed = Some(mbps.into());
    }

    pub fn set_unknown(&mut self) {
        self.wifi_speed = Some("0".to_string());
    }

    pub fn is_valid(&self) -> bool {
        self.crowd.is_some()
            && self.outlets.is_some()
            && self.noise.is_some()
            && self.wifi_speed.is_some()
    }

    pub fn cycle(&mut self, field: CheckInField, forward: bool) {
        match (field, forward) {
            (CheckInField::Crowd, true) => self.crowd = Some(step_forward(self.crowd)),
            (CheckInField::Crowd, false) => self.crowd = Some(step_back(self.crowd)),
            (CheckInField::Outlets, true) => self.outlets = Some(step_forward(self.outlets)),
            (CheckInField::Outlets, false) => self.outlets = Some(step_back(self.outlets)),
            (CheckInField::Noise, true) => self.noise = Some(step_forward(self.noise)),
            (CheckInField::Noise, false) => self.noise = Some(step_back(self.noise)),
        }
    }

    pub fn label(&self, field: CheckInField) -> Option<&'static str> {
        match field {
            CheckInField::Crowd => self.crowd.map(Choice::label),
            CheckInField::Outlets => self.outlets.map(Choice::label),
            CheckInField::Noise => self.noise.map(Choice::label),
        }
    }

    pub fn payload(&self, cafe_id: &str) -> Option<Result<CheckInPayload, ParseFloatError>> {
        let (Some(crowd), Some(outlets), Some(noise), Some(speed)) =
            (self.crowd, self.outlets, self.noise, self.wifi_speed.as_deref())
        else {
            return None;
        };
        Some(speed.parse().map(|wifi_speed| CheckInPayload {
            cafe_id: cafe_id.to_string(),
            crowd_level: crowd,
            wifi_speed,
            power_outlets: outlets,
            noise_level: noise,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckInPayload {
    pub cafe_id: String,
    pub crowd_level: CrowdLevel,
    pub wifi_speed: f64,
    pub power_outlets: PowerOutlets,
    pub noise_level: NoiseLevel,
}
