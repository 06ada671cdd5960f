// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use anyhow::{bail, Result};
use gpt_disk_types::{GptPartitionType, Guid};
use std::fmt;
use std::str::FromStr;

/// The vboot fields of a ChromeOS kernel partition, as cgpt reports them
/// with `show -A`: a 16-bit value holding priority, tries and successful.
/// See: <https://www.chromium.org/chromium-os/developer-library/reference/device/disk-format/>
///
///  bits | meaning
/// =================
///     8 | successful
///   7-4 | tries
///   3-0 | priority
///
/// Note this is the shifted-down view of the same fields that live in
/// bits 48-56 of the full 64-bit GPT attribute word.
#[derive(Clone, Copy, Debug, Default, Eq, Ord, PartialEq, PartialOrd)]
pub struct KernelAttributes {
    data: u16,
}

impl KernelAttributes {
    const PRIORITY_OFFSET: u16 = 0;
    const TRIES_OFFSET: u16 = 4;
    const SUCCESSFUL_OFFSET: u16 = 8;
    const FIELD_MAX: u8 = 0b1111;

    /// Attributes from the raw 16-bit value cgpt prints.
    #[must_use]
    pub fn from_raw(raw: u16) -> KernelAttributes {
        KernelAttributes { data: raw }
    }

    /// Build an attribute triple, rejecting out-of-range fields. The
    /// priority and tries fields are 4 bits wide.
    pub fn new(successful: bool, priority: u8, tries: u8) -> Result<KernelAttributes> {
        if priority > Self::FIELD_MAX {
            bail!("priority {priority} does not fit in 4 bits");
        }
        if tries > Self::FIELD_MAX {
            bail!("tries {tries} does not fit in 4 bits");
        }
        Ok(KernelAttributes {
            data: (u16::from(successful) << Self::SUCCESSFUL_OFFSET)
                | (u16::from(tries) << Self::TRIES_OFFSET)
                | (u16::from(priority) << Self::PRIORITY_OFFSET),
        })
    }

    /// The raw value to hand back to `cgpt add -A`.
    #[must_use]
    pub fn to_raw(self) -> u16 {
        self.data
    }

    /// True once the OS has acknowledged a successful boot from this
    /// partition.
    #[must_use]
    pub fn successful(self) -> bool {
        (self.data >> Self::SUCCESSFUL_OFFSET) & 0x1 != 0
    }

    /// Remaining boot attempts. 15 = highest, 0 = no attempts left.
    #[must_use]
    pub fn tries(self) -> u8 {
        ((self.data >> Self::TRIES_OFFSET) & 0xF) as u8
    }

    /// Boot priority. 15 = most preferred, 0 = firmware will never pick
    /// this partition.
    #[must_use]
    pub fn priority(self) -> u8 {
        ((self.data >> Self::PRIORITY_OFFSET) & 0xF) as u8
    }

    /// True if the firmware can consider this partition at all.
    #[must_use]
    pub fn bootable(self) -> bool {
        self.priority() != 0
    }
}

impl fmt::Display for KernelAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "successful={} priority={} tries={}",
            u8::from(self.successful()),
            self.priority(),
            self.tries()
        )
    }
}

/// Whether a GPT partition type GUID (as printed by `cgpt show -t`) is
/// the fixed ChromeOS kernel partition type. Comparison is
/// case-insensitive via GUID parsing.
#[must_use]
pub fn is_kernel_guid(type_guid: &str) -> bool {
    match Guid::from_str(type_guid.trim()) {
        Ok(guid) => guid == GptPartitionType::CHROME_OS_KERNEL.0,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for successful in [false, true] {
            for priority in 0..=15 {
                for tries in 0..=15 {
                    let attrs = KernelAttributes::new(successful, priority, tries).unwrap();
                    let attrs = KernelAttributes::from_raw(attrs.to_raw());
                    assert_eq!(attrs.successful(), successful);
                    assert_eq!(attrs.priority(), priority);
                    assert_eq!(attrs.tries(), tries);
                }
            }
        }
    }

    #[test]
    fn test_field_layout() {
        // The values written wholesale during rotation: 0x111 after a
        // successful boot, 0x010 for a freshly written image.
        let blessed = KernelAttributes::from_raw(0x111);
        assert!(blessed.successful());
        assert_eq!(blessed.tries(), 1);
        assert_eq!(blessed.priority(), 1);

        let fresh = KernelAttributes::from_raw(0x010);
        assert!(!fresh.successful());
        assert_eq!(fresh.tries(), 1);
        assert_eq!(fresh.priority(), 0);

        assert_eq!(KernelAttributes::new(true, 1, 1).unwrap().to_raw(), 0x111);
        assert_eq!(KernelAttributes::new(false, 0, 1).unwrap().to_raw(), 0x010);
    }

    #[test]
    fn test_out_of_range() {
        assert!(KernelAttributes::new(false, 16, 0).is_err());
        assert!(KernelAttributes::new(false, 0, 16).is_err());
    }

    #[test]
    fn test_disabled_is_not_bootable() {
        assert!(!KernelAttributes::from_raw(0x100).bootable());
        assert!(KernelAttributes::from_raw(0x001).bootable());
    }

    #[test]
    fn test_kernel_guid() {
        assert!(is_kernel_guid("FE3A2A5D-4F32-41A7-B725-ACCC3285A309"));
        assert!(is_kernel_guid("fe3a2a5d-4f32-41a7-b725-accc3285a309"));
        assert!(is_kernel_guid(" FE3A2A5D-4F32-41A7-B725-ACCC3285A309\n"));
        assert!(!is_kernel_guid("0FC63DAF-8483-4772-8E79-3D69D8477DE4"));
        assert!(!is_kernel_guid("not-a-guid"));
    }
}
