use std::{fmt, str::FromStr};

use anyhow::{anyhow, Error};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Cuda(usize),
    Metal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Cuda(0)
    }
}

impl FromStr for DeviceMap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let (backend, ordinal) = match s.split_once(':') {
            Some((backend, ordinal)) => {
                let ordinal = ordinal
                    .parse::<usize>()
                    .map_err(|_| anyhow!("invalid device ordinal in `{s}`"))?;
                (backend, ordinal)
            }
            None => (s.as_str(), 0),
        };
        match backend {
            "cpu" if ordinal == 0 => Ok(Self::ForceCpu),
            "cuda" => Ok(Self::Cuda(ordinal)),
            "metal" | "mps" => Ok(Self::Metal(ordinal)),
            _ => Err(anyhow!("unsupported device `{s}`")),
        }
    }
}

impl fmt::Display for DeviceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForceCpu => write!(f, "cpu"),
            Self::Cuda(ordinal) => write!(f, "cuda:{ordinal}"),
            Self::Metal(ordinal) => write!(f, "metal:{ordinal}"),
        }
    }
}
