//! Escrow factory, escrow and ERC-20 bindings

use ethers::prelude::abigen;

abigen!(
    EscrowFactory,
    r#"[
        function createEscrow(bytes32 orderKey, uint8 side, address depositor, address beneficiary, address token, uint256 amount, uint256 safetyDeposit, bytes32 hashlock, uint256 timelocks) external payable returns (address)
        function escrowOf(bytes32 orderKey, uint8 side) external view returns (address)
        event EscrowCreated(bytes32 indexed orderKey, uint8 indexed side, address escrow, uint256 deployedAt)
    ]"#
);

abigen!(
    HashedTimelockEscrow,
    r#"[
        function withdraw(bytes32 secret) external
        function cancel() external
    ]"#
);

abigen!(
    Erc20,
    r#"[
        function balanceOf(address account) external view returns (uint256)
        function allowance(address owner, address spender) external view returns (uint256)
        function approve(address spender, uint256 amount) external returns (bool)
    ]"#
);
