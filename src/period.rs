//! Temporal identity of a target: year plus an optional quarter or month.
//!
//! Callers submit a loose [`PeriodInput`]; [`validate`] turns it into a [`Period`]
//! whose shape can no longer disagree with its kind.

use crate::errors::{AppError, FieldError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MIN_YEAR: i32 = 2000;
pub const DEFAULT_MAX_YEAR: i32 = 2100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetKind {
    Yearly,
    Quarterly,
    Monthly,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Yearly => "yearly",
            Self::Quarterly => "quarterly",
            Self::Monthly => "monthly",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Quarter {
    Q1,
    Q2,
    Q3,
    Q4,
}

impl Quarter {
    pub const ALL: [Quarter; 4] = [Quarter::Q1, Quarter::Q2, Quarter::Q3, Quarter::Q4];

    pub fn number(self) -> u32 {
        match self {
            Self::Q1 => 1,
            Self::Q2 => 2,
            Self::Q3 => 3,
            Self::Q4 => 4,
        }
    }

    pub fn from_number(number: u32) -> Option<Self> {
        match number {
            1 => Some(Self::Q1),
            2 => Some(Self::Q2),
            3 => Some(Self::Q3),
            4 => Some(Self::Q4),
            _ => None,
        }
    }

    /// Months `3q-2, 3q-1, 3q`.
    pub fn months(self) -> [u32; 3] {
        let last = self.number() * 3;
        [last - 2, last - 1, last]
    }

    pub fn of_month(month: u32) -> Option<Self> {
        if (1..=12).contains(&month) {
            Self::from_number((month - 1) / 3 + 1)
        } else {
            None
        }
    }
}

impl fmt::Display for Quarter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Q{}", self.number())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YearBounds {
    pub min: i32,
    pub max: i32,
}

impl YearBounds {
    pub fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }

    fn unbounded() -> Self {
        Self {
            min: i32::MIN,
            max: i32::MAX,
        }
    }
}

impl Default for YearBounds {
    fn default() -> Self {
        Self::new(DEFAULT_MIN_YEAR, DEFAULT_MAX_YEAR)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeriodError {
    #[error("year {year} is outside {min}..={max}")]
    YearOutOfRange { year: i32, min: i32, max: i32 },
    #[error("quarter is required for quarterly targets")]
    MissingQuarter,
    #[error("month must not be set for quarterly targets")]
    UnexpectedMonth,
    #[error("month is required for monthly targets")]
    MissingMonth,
    #[error("month {0} is outside 1..=12")]
    MonthOutOfRange(u32),
    #[error("month {month} does not fall in {quarter}")]
    QuarterMonthMismatch { quarter: Quarter, month: u32 },
    #[error("yearly targets take neither quarter nor month")]
    UnexpectedSubPeriod,
}

impl PeriodError {
    pub fn field(&self) -> &'static str {
        match self {
            Self::YearOutOfRange { .. } => "period.year",
            Self::MissingQuarter | Self::QuarterMonthMismatch { .. } => "period.quarter",
            Self::UnexpectedMonth | Self::MissingMonth | Self::MonthOutOfRange(_) => "period.month",
            Self::UnexpectedSubPeriod => "period.kind",
        }
    }
}

impl From<PeriodError> for AppError {
    fn from(value: PeriodError) -> Self {
        AppError::Validation(vec![FieldError::new(value.field(), value.to_string())])
    }
}

/// Unvalidated period as it arrives from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodInput {
    pub year: i32,
    pub kind: TargetKind,
    #[serde(default)]
    pub quarter: Option<Quarter>,
    #[serde(default)]
    pub month: Option<u32>,
}

impl PeriodInput {
    pub fn yearly(year: i32) -> Self {
        Self {
            year,
            kind: TargetKind::Yearly,
            quarter: None,
            month: None,
        }
    }

    pub fn quarterly(year: i32, quarter: Quarter) -> Self {
        Self {
            year,
            kind: TargetKind::Quarterly,
            quarter: Some(quarter),
            month: None,
        }
    }

    pub fn monthly(year: i32, month: u32) -> Self {
        Self {
            year,
            kind: TargetKind::Monthly,
            quarter: None,
            month: Some(month),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeriodSlot {
    Yearly,
    Quarterly(Quarter),
    Monthly(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "PeriodInput", try_from = "PeriodInput")]
pub struct Period {
    pub year: i32,
    pub slot: PeriodSlot,
}

impl Period {
    pub fn kind(&self) -> TargetKind {
        match self.slot {
            PeriodSlot::Yearly => TargetKind::Yearly,
            PeriodSlot::Quarterly(_) => TargetKind::Quarterly,
            PeriodSlot::Monthly(_) => TargetKind::Monthly,
        }
    }

    /// The quarter the period sits in; monthly periods report their containing quarter.
    pub fn quarter(&self) -> Option<Quarter> {
        match self.slot {
            PeriodSlot::Yearly => None,
            PeriodSlot::Quarterly(quarter) => Some(quarter),
            PeriodSlot::Monthly(month) => Quarter::of_month(month),
        }
    }

    pub fn month(&self) -> Option<u32> {
        match self.slot {
            PeriodSlot::Monthly(month) => Some(month),
            _ => None,
        }
    }

    /// Canonical storage key: `2025`, `2025-Q2`, `2025-M05`.
    pub fn key(&self) -> String {
        match self.slot {
            PeriodSlot::Yearly => self.year.to_string(),
            PeriodSlot::Quarterly(quarter) => format!("{}-{}", self.year, quarter),
            PeriodSlot::Monthly(month) => format!("{}-M{:02}", self.year, month),
        }
    }
}

impl From<Period> for PeriodInput {
    fn from(value: Period) -> Self {
        Self {
            year: value.year,
            kind: value.kind(),
            quarter: value.quarter(),
            month: value.month(),
        }
    }
}

impl TryFrom<PeriodInput> for Period {
    type Error = PeriodError;

    fn try_from(value: PeriodInput) -> Result<Self, Self::Error> {
        validate(&value, YearBounds::unbounded())
    }
}

pub fn validate(input: &PeriodInput, bounds: YearBounds) -> Result<Period, PeriodError> {
    if input.year < bounds.min || input.year > bounds.max {
        return Err(PeriodError::YearOutOfRange {
            year: input.year,
            min: bounds.min,
            max: bounds.max,
        });
    }

    let slot = match input.kind {
        TargetKind::Yearly => {
            if input.quarter.is_some() || input.month.is_some() {
                return Err(PeriodError::UnexpectedSubPeriod);
            }
            PeriodSlot::Yearly
        }
        TargetKind::Quarterly => {
            if input.month.is_some() {
                return Err(PeriodError::UnexpectedMonth);
            }
            PeriodSlot::Quarterly(input.quarter.ok_or(PeriodError::MissingQuarter)?)
        }
        TargetKind::Monthly => {
            let month = input.month.ok_or(PeriodError::MissingMonth)?;
            let containing = Quarter::of_month(month).ok_or(PeriodError::MonthOutOfRange(month))?;
            if let Some(quarter) = input.quarter {
                if quarter != containing {
                    return Err(PeriodError::QuarterMonthMismatch { quarter, month });
                }
            }
            PeriodSlot::Monthly(month)
        }
    };

    Ok(Period {
        year: input.year,
        slot,
    })
}
