/*
 * Copyright 2022 Oxide Computer Company
 * Copyright 2022 OpenFlowLabs
 */

use anyhow::{anyhow, bail, Result};
use serde::Deserialize;
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;
const TIB: u64 = 1024 * GIB;

/*
 * Units accepted for image and file sizes, as understood by "qemu-img create"
 * and the tmpfs "size=" mount option.  Listed from largest to smallest so that
 * formatting can pick the first unit that divides evenly.
 */
const SIZE_UNITS: &[(&str, u64)] = &[("T", TIB), ("G", GIB), ("M", MIB), ("K", KIB)];

/**
 * A size in bytes, written in human form as "512M", "7800M", "4k" or "1T".
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct DiskSize(u64);

impl DiskSize {
    pub fn from_bytes(bytes: u64) -> DiskSize {
        DiskSize(bytes)
    }

    pub fn bytes(&self) -> u64 {
        self.0
    }
}

fn split_number(s: &str) -> Result<(u64, &str)> {
    let s = s.trim();
    let idx = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    if idx == 0 {
        bail!("size \"{}\" does not start with a number", s);
    }

    let (num, unit) = s.split_at(idx);
    let num = num
        .parse::<u64>()
        .map_err(|e| anyhow!("size \"{}\": {}", s, e))?;
    Ok((num, unit))
}

/**
 * Parse a size string.  A bare number or a "b" suffix means bytes; "k" and
 * "K" are both kibibytes; "M", "G" and "T" are the larger binary multiples.
 */
pub fn parse_size(s: &str) -> Result<DiskSize> {
    let (num, unit) = split_number(s)?;
    let mult = match unit {
        "" | "b" => 1,
        "k" | "K" => KIB,
        "M" => MIB,
        "G" => GIB,
        "T" => TIB,
        u => bail!("size \"{}\": unsupported unit \"{}\"", s.trim(), u),
    };

    num.checked_mul(mult)
        .map(DiskSize)
        .ok_or_else(|| anyhow!("size \"{}\" is too large", s.trim()))
}

/**
 * Render a size using the largest unit that divides it evenly, falling back
 * to a plain byte count.
 */
pub fn format_size(size: DiskSize) -> String {
    for (suffix, mult) in SIZE_UNITS {
        if size.0 % mult == 0 {
            return format!("{}{}", size.0 / mult, suffix);
        }
    }
    format!("{}b", size.0)
}

impl fmt::Display for DiskSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_size(*self))
    }
}

impl FromStr for DiskSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<DiskSize> {
        parse_size(s)
    }
}

impl TryFrom<String> for DiskSize {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<DiskSize> {
        parse_size(&s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetUnit {
    KiB,
    MiB,
    GiB,
    TiB,
}

impl OffsetUnit {
    fn suffix(&self) -> &'static str {
        match self {
            OffsetUnit::KiB => "KiB",
            OffsetUnit::MiB => "MiB",
            OffsetUnit::GiB => "GiB",
            OffsetUnit::TiB => "TiB",
        }
    }
}

/**
 * A partition boundary as passed to parted, e.g. "129MiB".  Offsets are kept
 * in the unit they were written in; arithmetic between different units is
 * refused rather than silently converted.
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct DiskOffset {
    value: u64,
    unit: OffsetUnit,
}

impl DiskOffset {
    pub fn mib(value: u64) -> DiskOffset {
        DiskOffset {
            value,
            unit: OffsetUnit::MiB,
        }
    }

    pub fn value(&self) -> u64 {
        self.value
    }

    pub fn unit(&self) -> OffsetUnit {
        self.unit
    }

    /**
     * Add two offsets expressed in the same unit.
     */
    pub fn add(&self, other: &DiskOffset) -> Result<DiskOffset> {
        add_offsets(self, other)
    }
}

pub fn parse_offset(s: &str) -> Result<DiskOffset> {
    let (value, unit) = split_number(s)?;
    let unit = match unit {
        "KiB" => OffsetUnit::KiB,
        "MiB" => OffsetUnit::MiB,
        "GiB" => OffsetUnit::GiB,
        "TiB" => OffsetUnit::TiB,
        "" => bail!("offset \"{}\" has no unit (expected e.g. MiB)", s.trim()),
        u => bail!(
            "offset \"{}\": unsupported unit \"{}\" (expected KiB, MiB, GiB or TiB)",
            s.trim(),
            u
        ),
    };

    Ok(DiskOffset { value, unit })
}

pub fn add_offsets(a: &DiskOffset, b: &DiskOffset) -> Result<DiskOffset> {
    if a.unit != b.unit {
        bail!("cannot add offsets with mixed units: {} + {}", a, b);
    }

    let value = a
        .value
        .checked_add(b.value)
        .ok_or_else(|| anyhow!("offset overflow: {} + {}", a, b))?;
    Ok(DiskOffset {
        value,
        unit: a.unit,
    })
}

impl fmt::Display for DiskOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.suffix())
    }
}

impl FromStr for DiskOffset {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<DiskOffset> {
        parse_offset(s)
    }
}

impl TryFrom<String> for DiskOffset {
    type Error = anyhow::Error;

    fn try_from(s: String) -> Result<DiskOffset> {
        parse_offset(&s)
    }
}
