//! Money arithmetic using rust_decimal.
//!
//! Every amount is a `Decimal`; results are rounded to 2 decimal places,
//! half away from zero. None of these helpers panic: overflow collapses to
//! zero so a corrupt input can never produce an invalid total.

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};

/// Decimal places for stored monetary values.
pub const MONEY_DP: u32 = 2;

/// Round to currency precision (2 dp, half away from zero).
pub fn round_money(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(MONEY_DP, RoundingStrategy::MidpointAwayFromZero)
}

/// `a × b`, or zero on overflow.
pub fn mul(a: Decimal, b: Decimal) -> Decimal {
    a.checked_mul(b).unwrap_or(Decimal::ZERO)
}

/// `a + b`, or zero on overflow.
pub fn add(a: Decimal, b: Decimal) -> Decimal {
    a.checked_add(b).unwrap_or(Decimal::ZERO)
}

/// `base × percent / 100`, rounded.
pub fn percent_of(base: Decimal, percent: Decimal) -> Decimal {
    let scaled = mul(base, percent)
        .checked_div(Decimal::ONE_HUNDRED)
        .unwrap_or(Decimal::ZERO);
    round_money(scaled)
}

/// `amount × numerator / denominator`, rounded. Zero on overflow or a zero
/// denominator.
pub fn scale(amount: Decimal, numerator: Decimal, denominator: Decimal) -> Decimal {
    let scaled = mul(amount, numerator)
        .checked_div(denominator)
        .unwrap_or(Decimal::ZERO);
    round_money(scaled)
}

/// Sum an iterator of amounts without panicking.
pub fn sum<I: IntoIterator<Item = Decimal>>(values: I) -> Decimal {
    values.into_iter().fold(Decimal::ZERO, add)
}

/// Whether a sale is within one state (CGST + SGST) or across states (IGST).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupplyType {
    #[default]
    Intrastate,
    Interstate,
}

/// Per-line GST components. `cgst + sgst + igst` always equals the tax
/// amount the split was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GstSplit {
    #[serde(default)]
    pub cgst: Decimal,
    #[serde(default)]
    pub sgst: Decimal,
    #[serde(default)]
    pub igst: Decimal,
}

impl GstSplit {
    pub fn total(&self) -> Decimal {
        sum([self.cgst, self.sgst, self.igst])
    }
}

/// Split a (rounded) tax amount into its GST components.
///
/// Intrastate halves go CGST-first so an odd paisa lands on CGST and the
/// SGST half is the exact remainder. A single paisa of intrastate tax cannot
/// be split into two non-zero halves, so each half is rounded up to one
/// paisa and the split totals 0.02; callers store `split.total()` as the tax
/// amount.
pub fn split_gst(tax_amount: Decimal, supply: SupplyType) -> GstSplit {
    let tax_amount = round_money(tax_amount.max(Decimal::ZERO));
    match supply {
        SupplyType::Interstate => GstSplit {
            cgst: Decimal::ZERO,
            sgst: Decimal::ZERO,
            igst: tax_amount,
        },
        SupplyType::Intrastate => {
            let cgst = round_money(tax_amount / Decimal::TWO);
            let mut sgst = tax_amount - cgst;
            if sgst.is_zero() && !cgst.is_zero() {
                sgst = cgst;
            }
            GstSplit {
                cgst,
                sgst,
                igst: Decimal::ZERO,
            }
        }
    }
}

/// Clamp an amount into `[0, ceiling]`.
pub fn clamp_non_negative(value: Decimal, ceiling: Decimal) -> Decimal {
    value.max(Decimal::ZERO).min(ceiling.max(Decimal::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rounds_half_away_from_zero() {
        assert_eq!(round_money(dec!(2.255)), dec!(2.26));
        assert_eq!(round_money(dec!(2.254)), dec!(2.25));
        assert_eq!(round_money(dec!(-2.255)), dec!(-2.26));
    }

    #[test]
    fn test_five_percent_of_ninety_splits_evenly() {
        let tax = percent_of(dec!(90), dec!(5));
        assert_eq!(tax, dec!(4.50));
        let split = split_gst(tax, SupplyType::Intrastate);
        assert_eq!(split.cgst, dec!(2.25));
        assert_eq!(split.sgst, dec!(2.25));
        assert_eq!(split.igst, Decimal::ZERO);
    }

    #[test]
    fn test_odd_paisa_goes_to_cgst_and_sum_is_exact() {
        let split = split_gst(dec!(4.51), SupplyType::Intrastate);
        assert_eq!(split.cgst, dec!(2.26));
        assert_eq!(split.sgst, dec!(2.25));
        assert_eq!(split.total(), dec!(4.51));
    }

    #[test]
    fn test_single_paisa_tax_splits_into_both_halves() {
        let split = split_gst(dec!(0.01), SupplyType::Intrastate);
        assert_eq!(split.cgst, dec!(0.01));
        assert_eq!(split.sgst, dec!(0.01));
        assert_eq!(split.igst, Decimal::ZERO);
        assert_eq!(split.total(), dec!(0.02));

        let none = split_gst(Decimal::ZERO, SupplyType::Intrastate);
        assert_eq!(none.total(), Decimal::ZERO);

        let interstate = split_gst(dec!(0.01), SupplyType::Interstate);
        assert_eq!(interstate.igst, dec!(0.01));
    }

    #[test]
    fn test_scale_rounds_and_guards_zero_denominator() {
        assert_eq!(scale(dec!(2.25), dec!(3), dec!(1)), dec!(6.75));
        assert_eq!(scale(dec!(4.51), dec!(1), dec!(2)), dec!(2.26));
        assert_eq!(scale(dec!(4.50), dec!(1), Decimal::ZERO), Decimal::ZERO);
    }

    #[test]
    fn test_interstate_is_all_igst() {
        let split = split_gst(dec!(18), SupplyType::Interstate);
        assert_eq!(split.igst, dec!(18));
        assert_eq!(split.cgst + split.sgst, Decimal::ZERO);
    }

    #[test]
    fn test_overflow_collapses_to_zero() {
        assert_eq!(mul(Decimal::MAX, dec!(10)), Decimal::ZERO);
        assert_eq!(add(Decimal::MAX, Decimal::MAX), Decimal::ZERO);
    }

    #[test]
    fn test_clamp_bounds_both_sides() {
        assert_eq!(clamp_non_negative(dec!(-3), dec!(10)), Decimal::ZERO);
        assert_eq!(clamp_non_negative(dec!(30), dec!(10)), dec!(10));
        assert_eq!(clamp_non_negative(dec!(4), dec!(10)), dec!(4));
    }
}
