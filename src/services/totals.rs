//! Document total recalculation.
//!
//! Totals are always recomputed from the complete current line set, never
//! adjusted incrementally. Each line is rounded to cents on its own and the
//! header sums the rounded line amounts, so stored lines always add up to the
//! stored header.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use validator::ValidationError;

use crate::entities::{invoice_item, order_detail};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

fn invalid(code: &'static str, message: &'static str) -> ValidationError {
    let mut err = ValidationError::new(code);
    err.message = Some(message.into());
    err
}

pub(crate) fn validate_unit_price(price: &Decimal) -> Result<(), ValidationError> {
    if *price < Decimal::ZERO {
        return Err(invalid("unit_price", "Unit price cannot be negative"));
    }
    if round_money(*price) != *price {
        return Err(invalid("unit_price", "Unit price must have at most two decimal places"));
    }
    Ok(())
}

pub(crate) fn validate_quantity(quantity: &Decimal) -> Result<(), ValidationError> {
    if *quantity <= Decimal::ZERO {
        return Err(invalid("quantity", "Quantity must be greater than zero"));
    }
    if round_quantity(*quantity) != *quantity {
        return Err(invalid("quantity", "Quantity must have at most three decimal places"));
    }
    Ok(())
}

pub(crate) fn validate_tax_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if *rate < Decimal::ZERO || *rate > HUNDRED {
        return Err(invalid("tax_rate", "Tax rate must be between 0 and 100"));
    }
    Ok(())
}

pub(crate) fn validate_discount(discount: &Decimal) -> Result<(), ValidationError> {
    if *discount < Decimal::ZERO {
        return Err(invalid("discount_amount", "Discount cannot be negative"));
    }
    if round_money(*discount) != *discount {
        return Err(invalid("discount_amount", "Discount must have at most two decimal places"));
    }
    Ok(())
}

/// Anything that can be priced as a document line.
pub trait LineItem {
    fn quantity(&self) -> Decimal;
    fn unit_price(&self) -> Decimal;
    /// Tax percentage (0 to 100).
    fn tax_rate(&self) -> Decimal {
        Decimal::ZERO
    }
}

/// Rounds a monetary amount to cents, midpoint away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Rounds an invoice quantity to the three decimals the store keeps.
pub fn round_quantity(quantity: Decimal) -> Decimal {
    quantity.round_dp_with_strategy(3, RoundingStrategy::MidpointAwayFromZero)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineAmounts {
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub total: Decimal,
}

pub fn line_amounts(quantity: Decimal, unit_price: Decimal, tax_rate: Decimal) -> LineAmounts {
    let subtotal = round_money(quantity * unit_price);
    let tax_amount = round_money(subtotal * tax_rate / HUNDRED);
    LineAmounts {
        subtotal,
        tax_amount,
        total: subtotal + tax_amount,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DocumentTotals {
    pub subtotal: Decimal,
    pub tax_amount: Decimal,
    pub discount_amount: Decimal,
    pub total_amount: Decimal,
}

impl DocumentTotals {
    /// Subtotal plus tax, before the header discount.
    pub fn gross(&self) -> Decimal {
        self.subtotal + self.tax_amount
    }
}

/// Prices a full line set. Orders pass a zero discount.
pub fn recalculate<'a, L, I>(items: I, discount: Decimal) -> DocumentTotals
where
    L: LineItem + 'a,
    I: IntoIterator<Item = &'a L>,
{
    let (subtotal, tax_amount) = items
        .into_iter()
        .map(|item| line_amounts(item.quantity(), item.unit_price(), item.tax_rate()))
        .fold((Decimal::ZERO, Decimal::ZERO), |(sub, tax), line| {
            (sub + line.subtotal, tax + line.tax_amount)
        });

    let discount_amount = round_money(discount);
    DocumentTotals {
        subtotal,
        tax_amount,
        discount_amount,
        total_amount: subtotal + tax_amount - discount_amount,
    }
}

impl LineItem for order_detail::Model {
    fn quantity(&self) -> Decimal {
        Decimal::from(self.quantity)
    }

    fn unit_price(&self) -> Decimal {
        self.unit_price
    }
}

impl LineItem for invoice_item::Model {
    fn quantity(&self) -> Decimal {
        self.quantity
    }

    fn unit_price(&self) -> Decimal {
        self.unit_price
    }

    fn tax_rate(&self) -> Decimal {
        self.tax_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    #[derive(Debug, Clone)]
    struct Line(Decimal, Decimal, Decimal);

    impl LineItem for Line {
        fn quantity(&self) -> Decimal {
            self.0
        }
        fn unit_price(&self) -> Decimal {
            self.1
        }
        fn tax_rate(&self) -> Decimal {
            self.2
        }
    }

    #[test]
    fn order_lines_sum_to_total() {
        let lines = vec![
            Line(dec!(2), dec!(10.00), Decimal::ZERO),
            Line(dec!(1), dec!(5.00), Decimal::ZERO),
        ];
        let totals = recalculate(&lines, Decimal::ZERO);
        assert_eq!(totals.subtotal, dec!(25.00));
        assert_eq!(totals.total_amount, dec!(25.00));
    }

    #[test]
    fn empty_document_totals_are_zero() {
        let lines: Vec<Line> = Vec::new();
        assert_eq!(recalculate(&lines, Decimal::ZERO), DocumentTotals::default());
    }

    #[test]
    fn invoice_totals_apply_tax_and_discount() {
        let lines = vec![
            Line(dec!(3), dec!(10.00), dec!(10)),
            Line(dec!(1.5), dec!(4.00), dec!(0)),
        ];
        let totals = recalculate(&lines, dec!(6.00));
        assert_eq!(totals.subtotal, dec!(36.00));
        assert_eq!(totals.tax_amount, dec!(3.00));
        assert_eq!(totals.discount_amount, dec!(6.00));
        assert_eq!(totals.total_amount, dec!(33.00));
        assert_eq!(totals.gross(), dec!(39.00));
    }

    #[rstest]
    #[case(dec!(1), dec!(0.125), dec!(0), dec!(0.13))]
    #[case(dec!(3), dec!(0.335), dec!(0), dec!(1.01))]
    #[case(dec!(1), dec!(10.00), dec!(7.5), dec!(10.75))]
    #[case(dec!(2.5), dec!(3.10), dec!(15), dec!(8.91))]
    fn line_rounding_is_half_away_from_zero(
        #[case] quantity: Decimal,
        #[case] unit_price: Decimal,
        #[case] tax_rate: Decimal,
        #[case] expected_total: Decimal,
    ) {
        assert_eq!(line_amounts(quantity, unit_price, tax_rate).total, expected_total);
    }

    #[test]
    fn tax_is_computed_per_line() {
        // 0.05 at 10% is 0.005 per line, which rounds to 0.01 on each line
        let lines = vec![
            Line(dec!(1), dec!(0.05), dec!(10)),
            Line(dec!(1), dec!(0.05), dec!(10)),
        ];
        assert_eq!(recalculate(&lines, Decimal::ZERO).tax_amount, dec!(0.02));
    }

    #[test]
    fn field_validators() {
        assert!(validate_unit_price(&dec!(0)).is_ok());
        assert!(validate_unit_price(&dec!(-0.01)).is_err());
        assert!(validate_unit_price(&dec!(2.999)).is_err());
        assert!(validate_quantity(&dec!(0.125)).is_ok());
        assert!(validate_quantity(&dec!(0.1255)).is_err());
        assert!(validate_quantity(&dec!(0)).is_err());
        assert!(validate_tax_rate(&dec!(100)).is_ok());
        assert!(validate_tax_rate(&dec!(100.01)).is_err());
        assert!(validate_discount(&dec!(-1)).is_err());
    }

    fn arb_line() -> impl Strategy<Value = Line> {
        (1u32..50, 0u32..100_000, 0u32..=100).prop_map(|(q, cents, rate)| {
            Line(Decimal::from(q), Decimal::new(cents as i64, 2), Decimal::from(rate))
        })
    }

    proptest! {
        #[test]
        fn header_equals_sum_of_lines(lines in prop::collection::vec(arb_line(), 0..20)) {
            let totals = recalculate(&lines, Decimal::ZERO);
            let by_line: Decimal = lines
                .iter()
                .map(|l| line_amounts(l.0, l.1, l.2).total)
                .sum();
            prop_assert_eq!(totals.total_amount, by_line);
            prop_assert_eq!(totals.subtotal + totals.tax_amount, totals.gross());
        }

        #[test]
        fn recalculation_is_order_independent(mut lines in prop::collection::vec(arb_line(), 0..20)) {
            let forward = recalculate(&lines, Decimal::ZERO);
            lines.reverse();
            prop_assert_eq!(forward, recalculate(&lines, Decimal::ZERO));
        }
    }
}
