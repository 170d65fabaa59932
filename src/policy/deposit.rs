use crate::model::EscrowRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowAction {
    Withdraw,
    Cancel,
}

/// Where an escrow's balances go when it closes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payout {
    pub funds_to: String,
    pub safety_deposit_to: String,
}

/// The locked amount goes to the beneficiary on withdrawal and back to the
/// depositor on cancellation. The safety deposit always pays whoever executed
/// the call, which is what makes public windows worth acting on.
pub fn payout(escrow: &EscrowRecord, action: EscrowAction, executor: &str) -> Payout {
    let funds_to = match action {
        EscrowAction::Withdraw => escrow.beneficiary.clone(),
        EscrowAction::Cancel => escrow.depositor.clone(),
    };
    Payout {
        funds_to,
        safety_deposit_to: executor.to_string(),
    }
}
