//! Command-stream encoding
//!
//! Each command is a header dword (`opcode << 24 | flags`) followed by a fixed
//! number of payload dwords. The encoding is private to this crate and the
//! software device; it is not modeled on a real instruction set.

use super::EngineId;

/// The no-op command word used for ring padding
pub const NOOP: u32 = 0;

const OP_NOOP: u32 = 0x00;
const OP_USER_INTERRUPT: u32 = 0x02;
const OP_WAIT_FOR_EVENT: u32 = 0x03;
const OP_FLUSH: u32 = 0x04;
const OP_SEMAPHORE_WAIT: u32 = 0x1c;
const OP_STORE_SEQNO: u32 = 0x21;
const OP_BATCH_START: u32 = 0x31;

const FLAG_SECURE: u32 = 1 << 8;

/// A decoded ring command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Padding
    Noop,
    /// Flush the given write domains and invalidate the given read domains
    Flush {
        /// Domains whose caches are invalidated
        invalidate: u32,
        /// Domains whose writes are flushed
        flush: u32,
    },
    /// Stall until pending flips on the given display planes complete
    WaitForEvent {
        /// Plane bitmask
        planes: u32,
    },
    /// Stall until another engine's seqno reaches a value
    SemaphoreWait {
        /// Engine that signals
        signaller: EngineId,
        /// Seqno to wait for
        seqno: u32,
    },
    /// Jump into a batch buffer
    BatchStart {
        /// GPU address of the first batch command
        address: u32,
        /// Batch length in bytes
        length: u32,
        /// Run with privileged command access
        secure: bool,
    },
    /// Write the seqno into the status page
    StoreSeqno {
        /// Seqno value
        seqno: u32,
    },
    /// Raise a user interrupt
    UserInterrupt,
}

impl Command {
    /// Encoded length in dwords
    pub fn len(&self) -> usize {
        match self {
            Command::Noop | Command::UserInterrupt => 1,
            Command::WaitForEvent { .. } | Command::StoreSeqno { .. } => 2,
            Command::Flush { .. } | Command::SemaphoreWait { .. } | Command::BatchStart { .. } => 3,
        }
    }

    /// Append the encoded words to `out`
    pub fn encode(&self, out: &mut Vec<u32>) {
        match *self {
            Command::Noop => out.push(NOOP),
            Command::UserInterrupt => out.push(OP_USER_INTERRUPT << 24),
            Command::WaitForEvent { planes } => {
                out.extend_from_slice(&[OP_WAIT_FOR_EVENT << 24, planes]);
            }
            Command::StoreSeqno { seqno } => {
                out.extend_from_slice(&[OP_STORE_SEQNO << 24, seqno]);
            }
            Command::Flush { invalidate, flush } => {
                out.extend_from_slice(&[OP_FLUSH << 24, invalidate, flush]);
            }
            Command::SemaphoreWait { signaller, seqno } => {
                out.extend_from_slice(&[OP_SEMAPHORE_WAIT << 24, signaller.index() as u32, seqno]);
            }
            Command::BatchStart {
                address,
                length,
                secure,
            } => {
                let flags = if secure { FLAG_SECURE } else { 0 };
                out.extend_from_slice(&[OP_BATCH_START << 24 | flags, address, length]);
            }
        }
    }

    /// Decode the command at the start of `words`
    ///
    /// Returns `None` for an unknown opcode or a truncated command.
    pub fn decode(words: &[u32]) -> Option<Command> {
        let header = *words.first()?;
        let arg = |i: usize| words.get(i).copied();
        let cmd = match header >> 24 {
            OP_NOOP => Command::Noop,
            OP_USER_INTERRUPT => Command::UserInterrupt,
            OP_WAIT_FOR_EVENT => Command::WaitForEvent { planes: arg(1)? },
            OP_STORE_SEQNO => Command::StoreSeqno { seqno: arg(1)? },
            OP_FLUSH => Command::Flush {
                invalidate: arg(1)?,
                flush: arg(2)?,
            },
            OP_SEMAPHORE_WAIT => Command::SemaphoreWait {
                signaller: EngineId::from_index(arg(1)? as usize)?,
                seqno: arg(2)?,
            },
            OP_BATCH_START => Command::BatchStart {
                address: arg(1)?,
                length: arg(2)?,
                secure: header & FLAG_SECURE != 0,
            },
            _ => return None,
        };
        Some(cmd)
    }
}

/// Total encoded length of a command sequence in dwords
pub fn encoded_len(commands: &[Command]) -> usize {
    commands.iter().map(Command::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encoded_sequence_decodes_in_order() {
        let commands = [
            Command::Flush {
                invalidate: 0x3e,
                flush: 0x02,
            },
            Command::BatchStart {
                address: 0x1000,
                length: 64,
                secure: true,
            },
            Command::StoreSeqno { seqno: 7 },
            Command::UserInterrupt,
        ];
        let mut words = Vec::new();
        for cmd in &commands {
            cmd.encode(&mut words);
        }
        assert_eq!(words.len(), encoded_len(&commands));

        let mut pos = 0;
        let mut decoded = Vec::new();
        while pos < words.len() {
            let cmd = Command::decode(&words[pos..]).unwrap();
            pos += cmd.len();
            decoded.push(cmd);
        }
        assert_eq!(decoded, commands.to_vec());
    }

    #[test]
    fn test_decode_rejects_truncated_and_unknown() {
        assert_eq!(Command::decode(&[OP_STORE_SEQNO << 24]), None);
        assert_eq!(Command::decode(&[0x7f << 24]), None);
        assert_eq!(Command::decode(&[]), None);
        assert_eq!(Command::decode(&[NOOP]), Some(Command::Noop));
    }
}
