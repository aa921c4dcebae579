//! Named saga steps and the compensation table.

use serde::{Deserialize, Serialize};

/// Forward steps of the order-payment saga, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SagaStep {
    ReserveInventory,
    ConfirmOrder,
    ProcessPayment,
    DeductInventory,
    CompleteOrder,
}

impl SagaStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStep::ReserveInventory => "reserve_inventory",
            SagaStep::ConfirmOrder => "confirm_order",
            SagaStep::ProcessPayment => "process_payment",
            SagaStep::DeductInventory => "deduct_inventory",
            SagaStep::CompleteOrder => "complete_order",
        }
    }
}

/// Actions that undo a committed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Compensation {
    ReleaseInventory,
    RefundPayment,
    ReturnStock,
}

impl Compensation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compensation::ReleaseInventory => "release_inventory",
            Compensation::RefundPayment => "refund_payment",
            Compensation::ReturnStock => "return_stock",
        }
    }
}

/// The compensation table.
pub fn compensation_for(step: SagaStep) -> Option<Compensation> {
    match step {
        SagaStep::ReserveInventory => Some(Compensation::ReleaseInventory),
        SagaStep::ProcessPayment => Some(Compensation::RefundPayment),
        SagaStep::DeductInventory => Some(Compensation::ReturnStock),
        SagaStep::ConfirmOrder | SagaStep::CompleteOrder => None,
    }
}

/// Compensations to run for the given completed steps, most recent first.
pub fn plan_compensations(completed: &[SagaStep]) -> Vec<(SagaStep, Compensation)> {
    completed
        .iter()
        .rev()
        .filter_map(|step| compensation_for(*step).map(|c| (*step, c)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_steps() {
        assert_eq!(
            compensation_for(SagaStep::ReserveInventory),
            Some(Compensation::ReleaseInventory)
        );
        assert_eq!(
            compensation_for(SagaStep::ProcessPayment),
            Some(Compensation::RefundPayment)
        );
        assert_eq!(
            compensation_for(SagaStep::DeductInventory),
            Some(Compensation::ReturnStock)
        );
        assert_eq!(compensation_for(SagaStep::ConfirmOrder), None);
        assert_eq!(compensation_for(SagaStep::CompleteOrder), None);
    }

    #[test]
    fn plan_runs_in_reverse() {
        let plan = plan_compensations(&[
            SagaStep::ReserveInventory,
            SagaStep::ConfirmOrder,
            SagaStep::ProcessPayment,
        ]);
        assert_eq!(
            plan,
            vec![
                (SagaStep::ProcessPayment, Compensation::RefundPayment),
                (SagaStep::ReserveInventory, Compensation::ReleaseInventory),
            ]
        );
    }

    #[test]
    fn deducted_order_returns_stock_instead_of_releasing() {
        // the deduction consumed the reservation, so it is no longer listed
        let plan = plan_compensations(&[
            SagaStep::ConfirmOrder,
            SagaStep::ProcessPayment,
            SagaStep::DeductInventory,
        ]);
        assert_eq!(
            plan,
            vec![
                (SagaStep::DeductInventory, Compensation::ReturnStock),
                (SagaStep::ProcessPayment, Compensation::RefundPayment),
            ]
        );
    }
}
