use crate::errors::VmError;

/// Main mode of operation: selects the transition handler for a step. The
/// byte values are a wire contract shared with the on-chain judge; the error
/// ranges in particular must not move.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExecMode {
    #[default]
    BlockPre = 0x00,

    TxLoad = 0x01,
    TxSig = 0x02,
    TxFeesPre = 0x03,
    TxFeesPost = 0x04,

    // Interpreter loop: stack/memory/gas checks, then opcode execution.
    OpcodeLoad = 0x11,
    ValidateStack = 0x12,
    ReadOnlyCheck = 0x13,
    ConstantGas = 0x14,
    CalcMemorySize = 0x15,
    DynamicGas = 0x16,
    UpdateMemorySize = 0x17,
    OpcodeRun = 0x18,

    // Every call opcode shares a setup state machine.
    CallSetup = 0x30,
    CallPre = 0x31,
    CallPost = 0x32,
    CallRevert = 0x33,

    CreateSetup = 0x34,
    CreateInitPost = 0x35,
    CreateInitRevert = 0x36,
    CreateInitErr = 0x37,

    // Frame-local outcomes: the frame unwinds, block processing continues.
    // ErrStop is the regular halt; the rest burn or return gas per category.
    ErrStop = 0x40,
    ErrStackUnderflow = 0x41,
    ErrStackOverflow = 0x42,
    ErrWriteProtection = 0x43,
    ErrOutOfGas = 0x44,
    ErrGasUintOverflow = 0x45,
    ErrInvalidJump = 0x46,
    ErrReturnDataOutOfBounds = 0x47,
    ErrDepth = 0x48,
    ErrInsufficientBalance = 0x49,
    ErrExecutionReverted = 0x4a,

    // Block-fatal: the block itself is invalid, generation stops.
    ErrInvalidTransactionType = 0x50,
    ErrInvalidTransactionChain = 0x51,
    ErrInvalidTransactionSig = 0x52,

    StateWork = 0x60,
    MptWork = 0x61,

    BlockPreStateLoad = 0x70,
    BlockHistoryLoad = 0x71,
    BlockCalcBaseFee = 0x72,
    BlockTxLoop = 0x73,
    BlockTxSuccess = 0x74,
    BlockTxErr = 0x75,
    BlockTxRevert = 0x76,

    BlockPost = 0x80,

    Done = 0xff,
}

impl ExecMode {
    pub fn from_byte(byte: u8) -> Result<Self, VmError> {
        use ExecMode::*;
        let mode = match byte {
            0x00 => BlockPre,
            0x01 => TxLoad,
            0x02 => TxSig,
            0x03 => TxFeesPre,
            0x04 => TxFeesPost,
            0x11 => OpcodeLoad,
            0x12 => ValidateStack,
            0x13 => ReadOnlyCheck,
            0x14 => ConstantGas,
            0x15 => CalcMemorySize,
            0x16 => DynamicGas,
            0x17 => UpdateMemorySize,
            0x18 => OpcodeRun,
            0x30 => CallSetup,
            0x31 => CallPre,
            0x32 => CallPost,
            0x33 => CallRevert,
            0x34 => CreateSetup,
            0x35 => CreateInitPost,
            0x36 => CreateInitRevert,
            0x37 => CreateInitErr,
            0x40 => ErrStop,
            0x41 => ErrStackUnderflow,
            0x42 => ErrStackOverflow,
            0x43 => ErrWriteProtection,
            0x44 => ErrOutOfGas,
            0x45 => ErrGasUintOverflow,
            0x46 => ErrInvalidJump,
            0x47 => ErrReturnDataOutOfBounds,
            0x48 => ErrDepth,
            0x49 => ErrInsufficientBalance,
            0x4a => ErrExecutionReverted,
            0x50 => ErrInvalidTransactionType,
            0x51 => ErrInvalidTransactionChain,
            0x52 => ErrInvalidTransactionSig,
            0x60 => StateWork,
            0x61 => MptWork,
            0x70 => BlockPreStateLoad,
            0x71 => BlockHistoryLoad,
            0x72 => BlockCalcBaseFee,
            0x73 => BlockTxLoop,
            0x74 => BlockTxSuccess,
            0x75 => BlockTxErr,
            0x76 => BlockTxRevert,
            0x80 => BlockPost,
            0xff => Done,
            other => return Err(VmError::InvalidExecMode(other)),
        };
        Ok(mode)
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Frame-local outcome range: the current frame unwinds through
    /// `return_to_step`.
    pub fn is_frame_exit(self) -> bool {
        (0x40..=0x4a).contains(&(self as u8))
    }

    /// Errors that invalidate the whole block.
    pub fn is_block_fatal(self) -> bool {
        (0x50..=0x52).contains(&(self as u8))
    }

    pub fn is_done(self) -> bool {
        self == Self::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip() {
        for byte in 0u8..=0xff {
            if let Ok(mode) = ExecMode::from_byte(byte) {
                assert_eq!(mode.as_byte(), byte);
            }
        }
    }

    #[test]
    fn ranges() {
        assert!(ExecMode::ErrStop.is_frame_exit());
        assert!(ExecMode::ErrExecutionReverted.is_frame_exit());
        assert!(!ExecMode::ErrInvalidTransactionSig.is_frame_exit());
        assert!(ExecMode::ErrInvalidTransactionType.is_block_fatal());
        assert!(ExecMode::Done.is_done());
    }
}
