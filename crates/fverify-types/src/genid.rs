//! Record identity (genid) and stripe placement arithmetic.
//!
//! A genid is a 64-bit, time-ordered record identifier. Its logical layout:
//!
//! ```text
//!  63                                    16 15               4 3      0
//! +----------------------------------------+------------------+--------+
//! |            creation stamp              |    update id     | stripe |
//! +----------------------------------------+------------------+--------+
//! ```
//!
//! - the creation stamp orders records by insertion time,
//! - the update id is bumped by in-place updates of the same record,
//! - the stripe nibble names the data stripe the record was written to.
//!
//! On disk the genid is stored big-endian, so lexicographic key order equals
//! numeric order. All functions here are pure.

use std::fmt;

use fverify_error::{Result, VerifyError};
use serde::{Deserialize, Serialize};

/// Width of an encoded genid in bytes.
pub const GENID_LEN: usize = 8;
/// Maximum number of data or blob stripes addressable by the stripe nibble.
pub const MAX_STRIPES: u32 = 16;

const STRIPE_BITS: u32 = 4;
const STRIPE_MASK: u64 = (1 << STRIPE_BITS) - 1;
const UPDATE_ID_SHIFT: u32 = STRIPE_BITS;
const UPDATE_ID_BITS: u32 = 12;
const UPDATE_ID_MASK: u64 = ((1 << UPDATE_ID_BITS) - 1) << UPDATE_ID_SHIFT;
const STAMP_SHIFT: u32 = UPDATE_ID_SHIFT + UPDATE_ID_BITS;

/// 64-bit record identity.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Genid(u64);

impl Genid {
    /// The all-zero genid. Used as the collapsed uniqueness suffix.
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Build a genid from its fields. Out-of-range fields are truncated.
    #[must_use]
    pub const fn compose(stamp: u64, update_id: u16, stripe: u32) -> Self {
        let update = ((update_id as u64) << UPDATE_ID_SHIFT) & UPDATE_ID_MASK;
        Self((stamp << STAMP_SHIFT) | update | (stripe as u64 & STRIPE_MASK))
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Creation stamp (time/sequence portion).
    #[must_use]
    pub const fn stamp(self) -> u64 {
        self.0 >> STAMP_SHIFT
    }

    #[must_use]
    pub const fn update_id(self) -> u16 {
        ((self.0 & UPDATE_ID_MASK) >> UPDATE_ID_SHIFT) as u16
    }

    /// Data stripe encoded in the genid. Range checking is the caller's job.
    #[must_use]
    pub const fn stripe(self) -> u32 {
        (self.0 & STRIPE_MASK) as u32
    }

    /// Search genid used as the uniqueness suffix of index keys.
    ///
    /// Clears the update id so an in-place update does not change the keys
    /// of indexes whose values did not change.
    #[must_use]
    pub const fn masked(self) -> Self {
        Self(self.0 & !UPDATE_ID_MASK)
    }

    /// Whether `self` was created strictly after `watermark`.
    #[must_use]
    pub const fn is_newer(self, watermark: Self) -> bool {
        self.stamp() > watermark.stamp()
    }

    /// Whether `self` was created strictly before `watermark`.
    #[must_use]
    pub const fn predates(self, watermark: Self) -> bool {
        self.stamp() < watermark.stamp()
    }

    /// On-disk (big-endian) encoding.
    #[must_use]
    pub const fn to_bytes(self) -> [u8; GENID_LEN] {
        self.0.to_be_bytes()
    }

    #[must_use]
    pub const fn from_bytes(bytes: [u8; GENID_LEN]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }

    /// Decode a genid from the first 8 bytes of `bytes`.
    #[must_use]
    pub fn from_prefix(bytes: &[u8]) -> Option<Self> {
        let prefix: [u8; GENID_LEN] = bytes.get(..GENID_LEN)?.try_into().ok()?;
        Some(Self::from_bytes(prefix))
    }

    /// Decode a genid that must occupy exactly `bytes`.
    #[must_use]
    pub fn from_exact(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != GENID_LEN {
            return None;
        }
        Self::from_prefix(bytes)
    }
}

impl fmt::Display for Genid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl fmt::Debug for Genid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Genid({:016x})", self.0)
    }
}

impl fmt::LowerHex for Genid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Physical placement of records and blobs across stripes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StripeLayout {
    /// Number of data stripes.
    pub data_stripes: u32,
    /// Number of blob stripes per blob column.
    pub blob_stripes: u32,
    /// Genid at which blobs were restriped. Genids created before it follow
    /// the data stripe; later ones are placed independently.
    pub restripe_watermark: Option<Genid>,
}

impl StripeLayout {
    #[must_use]
    pub const fn new(data_stripes: u32, blob_stripes: u32) -> Self {
        Self {
            data_stripes,
            blob_stripes,
            restripe_watermark: None,
        }
    }

    #[must_use]
    pub const fn with_watermark(mut self, watermark: Genid) -> Self {
        self.restripe_watermark = Some(watermark);
        self
    }

    /// Data stripe holding `genid`'s record.
    pub fn data_stripe_of(&self, genid: Genid) -> Result<u32> {
        let stripe = genid.stripe();
        if stripe >= self.data_stripes {
            return Err(VerifyError::UnknownStripe {
                genid: genid.get(),
                stripe,
            });
        }
        Ok(stripe)
    }

    /// Whether blob placement for `genid` must follow its data stripe.
    #[must_use]
    pub fn blob_aligned(&self, genid: Genid) -> bool {
        self.restripe_watermark
            .is_none_or(|watermark| genid.predates(watermark))
    }

    /// Blob stripe holding `genid`'s out-of-line rows.
    pub fn blob_stripe_of(&self, genid: Genid) -> Result<u32> {
        let data = self.data_stripe_of(genid)?;
        if self.blob_stripes == 0 {
            return Err(VerifyError::schema("layout has no blob stripes"));
        }
        let stripe = if self.blob_aligned(genid) {
            data
        } else {
            data % self.blob_stripes
        };
        if stripe >= self.blob_stripes {
            return Err(VerifyError::UnknownStripe {
                genid: genid.get(),
                stripe,
            });
        }
        Ok(stripe)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn compose_round_trips_fields() {
        let g = Genid::compose(0x1234_5678, 7, 3);
        assert_eq!(g.stamp(), 0x1234_5678);
        assert_eq!(g.update_id(), 7);
        assert_eq!(g.stripe(), 3);
    }

    #[test]
    fn masked_clears_update_id_only() {
        let g = Genid::compose(42, 0xABC, 5);
        let m = g.masked();
        assert_eq!(m.stamp(), 42);
        assert_eq!(m.update_id(), 0);
        assert_eq!(m.stripe(), 5);
        assert_eq!(m.masked(), m);
    }

    #[test]
    fn display_is_sixteen_hex_digits() {
        assert_eq!(Genid::new(1).to_string(), "0000000000000001");
        assert_eq!(
            Genid::new(0xdead_beef_0000_0001).to_string(),
            "deadbeef00000001"
        );
    }

    #[test]
    fn from_exact_rejects_wrong_width() {
        assert!(Genid::from_exact(&[0; 7]).is_none());
        assert!(Genid::from_exact(&[0; 9]).is_none());
        assert_eq!(Genid::from_exact(&[0, 0, 0, 0, 0, 0, 0, 1]), Some(Genid::new(1)));
        assert_eq!(
            Genid::from_prefix(&[0, 0, 0, 0, 0, 0, 1, 0, 0xff]),
            Some(Genid::new(256))
        );
    }

    #[test]
    fn data_stripe_out_of_range_is_error() {
        let layout = StripeLayout::new(2, 2);
        assert_eq!(layout.data_stripe_of(Genid::compose(1, 0, 1)).unwrap(), 1);
        let err = layout.data_stripe_of(Genid::compose(1, 0, 3)).unwrap_err();
        assert!(matches!(err, VerifyError::UnknownStripe { stripe: 3, .. }));
    }

    #[test]
    fn watermark_controls_alignment() {
        let watermark = Genid::compose(100, 0, 0);
        let layout = StripeLayout::new(4, 2).with_watermark(watermark);
        let old = Genid::compose(99, 0, 3);
        let new = Genid::compose(100, 0, 3);
        assert!(layout.blob_aligned(old));
        assert!(!layout.blob_aligned(new));
        // Aligned placement follows the data stripe even past blob_stripes.
        assert!(layout.blob_stripe_of(old).is_err());
        assert_eq!(layout.blob_stripe_of(new).unwrap(), 1);
    }

    #[test]
    fn no_watermark_means_always_aligned() {
        let layout = StripeLayout::new(4, 4);
        let g = Genid::compose(u64::from(u32::MAX), 1, 2);
        assert!(layout.blob_aligned(g));
        assert_eq!(layout.blob_stripe_of(g).unwrap(), 2);
    }

    proptest! {
        #[test]
        fn byte_order_matches_numeric_order(a in any::<u64>(), b in any::<u64>()) {
            let (ga, gb) = (Genid::new(a), Genid::new(b));
            prop_assert_eq!(ga.cmp(&gb), ga.to_bytes().cmp(&gb.to_bytes()));
            prop_assert_eq!(Genid::from_bytes(ga.to_bytes()), ga);
        }

        #[test]
        fn masking_preserves_stripe_and_stamp(raw in any::<u64>()) {
            let g = Genid::new(raw);
            prop_assert_eq!(g.masked().stripe(), g.stripe());
            prop_assert_eq!(g.masked().stamp(), g.stamp());
            prop_assert_eq!(g.masked().masked(), g.masked());
        }

        #[test]
        fn newer_and_predates_are_exclusive(a in any::<u64>(), b in any::<u64>()) {
            let (ga, gb) = (Genid::new(a), Genid::new(b));
            prop_assert!(!(ga.is_newer(gb) && ga.predates(gb)));
            prop_assert_eq!(ga.is_newer(gb), gb.predates(ga));
        }

        #[test]
        fn stripe_of_matches_compose(stamp in 0_u64..(1 << 40), update in any::<u16>(), stripe in 0_u32..MAX_STRIPES) {
            let layout = StripeLayout::new(MAX_STRIPES, MAX_STRIPES);
            let g = Genid::compose(stamp, update, stripe);
            prop_assert_eq!(layout.data_stripe_of(g).unwrap(), stripe);
        }
    }
}
