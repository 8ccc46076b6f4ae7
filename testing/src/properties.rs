//! `proptest` strategies for ledger properties.

use proptest::prelude::*;

/// One stock operation against a single variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StockOp {
    /// Reserve this many units under a fresh reference.
    Reserve(u32),
    /// Commit the n-th reservation made so far (modulo count).
    Commit(usize),
    /// Release the n-th reservation made so far (modulo count).
    Release(usize),
    /// Adjust physical stock.
    Adjust(i64),
}

/// Arbitrary stock operation with small quantities.
pub fn stock_op() -> impl Strategy<Value = StockOp> {
    prop_oneof![
        4 => (1u32..=5).prop_map(StockOp::Reserve),
        2 => any::<usize>().prop_map(StockOp::Commit),
        2 => any::<usize>().prop_map(StockOp::Release),
        1 => (-5i64..=10).prop_map(StockOp::Adjust),
    ]
}

/// Sequence of up to `max_len` stock operations.
pub fn stock_ops(max_len: usize) -> impl Strategy<Value = Vec<StockOp>> {
    prop::collection::vec(stock_op(), 0..=max_len)
}
