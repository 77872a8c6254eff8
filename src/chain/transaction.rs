//! Structural transaction parsing
//!
//! Transactions mirror the wire layout byte for byte; scripts and witness
//! stacks are opaque payloads and are never interpreted.

use crate::codec::hash::Hash256;
use crate::codec::{ByteReader, ByteWriter, CodecError};
use crate::chain::header::BlockHeader;

/// A transaction input: outpoint, unlocking script, sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxIn {
    pub prev_tx: Hash256,
    pub prev_index: u32,
    pub script: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let prev_tx = reader.read_fixed::<32>()?;
        let prev_index = reader.read_u32_le()?;
        let script_len = reader.read_varint()? as usize;
        let script = reader.read_bytes(script_len)?.to_vec();
        let sequence = reader.read_u32_le()?;
        Ok(Self {
            prev_tx,
            prev_index,
            script,
            sequence,
        })
    }

    fn write(&self, writer: &mut ByteWriter) {
        writer.write_bytes(&self.prev_tx);
        writer.write_u32_le(self.prev_index);
        writer.write_varint(self.script.len() as u64);
        writer.write_bytes(&self.script);
        writer.write_u32_le(self.sequence);
    }
}

/// A transaction output: value and locking script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOut {
    pub value: i64,
    pub script: Vec<u8>,
}

impl TxOut {
    fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let value = reader.read_i64_le()?;
        let script_len = reader.read_varint()? as usize;
        let script = reader.read_bytes(script_len)?.to_vec();
        Ok(Self { value, script })
    }

    fn write(&self, writer: &mut ByteWriter) {
        writer.write_i64_le(self.value);
        writer.write_varint(self.script.len() as u64);
        writer.write_bytes(&self.script);
    }
}

/// A structurally parsed transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TxIn>,
    pub outputs: Vec<TxOut>,
    /// One witness stack per input when the segwit marker was present
    pub witnesses: Option<Vec<Vec<Vec<u8>>>>,
    pub lock_time: u32,
}

impl Transaction {
    /// Reads one transaction, recognizing the segwit marker+flag form
    pub fn read(reader: &mut ByteReader<'_>) -> Result<Self, CodecError> {
        let version = reader.read_i32_le()?;

        // Segwit marker: a zero byte where the input count varint would be,
        // followed by a nonzero flag byte.
        let marker = reader.read_u8()?;
        let segwit = marker == 0;
        let input_count = if segwit {
            let _flag = reader.read_u8()?;
            reader.read_varint()? as usize
        } else {
            read_varint_with_first(reader, marker)? as usize
        };

        let mut inputs = Vec::with_capacity(input_count.min(10_000));
        for _ in 0..input_count {
            inputs.push(TxIn::read(reader)?);
        }

        let output_count = reader.read_varint()? as usize;
        let mut outputs = Vec::with_capacity(output_count.min(10_000));
        for _ in 0..output_count {
            outputs.push(TxOut::read(reader)?);
        }

        let witnesses = if segwit {
            let mut stacks = Vec::with_capacity(inputs.len());
            for _ in 0..inputs.len() {
                let item_count = reader.read_varint()? as usize;
                let mut stack = Vec::with_capacity(item_count.min(1000));
                for _ in 0..item_count {
                    let len = reader.read_varint()? as usize;
                    stack.push(reader.read_bytes(len)?.to_vec());
                }
                stacks.push(stack);
            }
            Some(stacks)
        } else {
            None
        };

        let lock_time = reader.read_u32_le()?;
        Ok(Self {
            version,
            inputs,
            outputs,
            witnesses,
            lock_time,
        })
    }

    /// Writes the transaction back in its original wire form
    pub fn write(&self, writer: &mut ByteWriter) {
        writer.write_i32_le(self.version);
        if self.witnesses.is_some() {
            writer.write_u8(0);
            writer.write_u8(1);
        }
        writer.write_varint(self.inputs.len() as u64);
        for input in &self.inputs {
            input.write(writer);
        }
        writer.write_varint(self.outputs.len() as u64);
        for output in &self.outputs {
            output.write(writer);
        }
        if let Some(stacks) = &self.witnesses {
            for stack in stacks {
                writer.write_varint(stack.len() as u64);
                for item in stack {
                    writer.write_varint(item.len() as u64);
                    writer.write_bytes(item);
                }
            }
        }
        writer.write_u32_le(self.lock_time);
    }
}

/// Completes a varint whose first byte has already been consumed
fn read_varint_with_first(reader: &mut ByteReader<'_>, first: u8) -> Result<u64, CodecError> {
    match first {
        0xFD => Ok(reader.read_u16_le()? as u64),
        0xFE => Ok(reader.read_u32_le()? as u64),
        0xFF => reader.read_u64_le(),
        n => Ok(n as u64),
    }
}

/// Parses a `block` payload: the header (with its transaction-count varint)
/// followed by that many transactions.
pub fn parse_block_payload(payload: &[u8]) -> Result<(BlockHeader, Vec<Transaction>), CodecError> {
    let mut reader = ByteReader::new(payload);
    let header = BlockHeader::read_wire(&mut reader)?;
    let count = header.tx_count as usize;
    let mut transactions = Vec::with_capacity(count.min(10_000));
    for _ in 0..count {
        transactions.push(Transaction::read(&mut reader)?);
    }
    Ok((header, transactions))
}

/// Serializes a transaction list for block-file persistence
pub fn serialize_transactions(transactions: &[Transaction]) -> Vec<u8> {
    let mut writer = ByteWriter::new();
    writer.write_varint(transactions.len() as u64);
    for tx in transactions {
        tx.write(&mut writer);
    }
    writer.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TxIn {
                prev_tx: [3u8; 32],
                prev_index: 1,
                script: vec![0x51, 0x52],
                sequence: 0xFFFF_FFFF,
            }],
            outputs: vec![TxOut {
                value: 5_000_000_000,
                script: vec![0x76, 0xA9, 0x14],
            }],
            witnesses: None,
            lock_time: 0,
        }
    }

    #[test]
    fn test_legacy_tx_roundtrip() {
        let tx = sample_tx();
        let mut writer = ByteWriter::new();
        tx.write(&mut writer);
        let bytes = writer.into_inner();

        let mut reader = ByteReader::new(&bytes);
        let decoded = Transaction::read(&mut reader).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_segwit_tx_roundtrip() {
        let mut tx = sample_tx();
        tx.witnesses = Some(vec![vec![vec![0xAA; 71], vec![0xBB; 33]]]);

        let mut writer = ByteWriter::new();
        tx.write(&mut writer);
        let bytes = writer.into_inner();
        // Marker and flag bytes follow the version field.
        assert_eq!(bytes[4], 0);
        assert_eq!(bytes[5], 1);

        let mut reader = ByteReader::new(&bytes);
        let decoded = Transaction::read(&mut reader).unwrap();
        assert_eq!(decoded, tx);
    }

    #[test]
    fn test_block_payload_parse() {
        let mut header = BlockHeader::new(1, [9u8; 32], [8u8; 32], 100, 200, 300);
        header.tx_count = 2;

        let mut writer = ByteWriter::new();
        header.write_wire(&mut writer);
        sample_tx().write(&mut writer);
        sample_tx().write(&mut writer);
        let payload = writer.into_inner();

        let (decoded_header, txs) = parse_block_payload(&payload).unwrap();
        assert_eq!(decoded_header.hash(), header.hash());
        assert_eq!(txs.len(), 2);
    }

    #[test]
    fn test_truncated_tx_rejected() {
        let tx = sample_tx();
        let mut writer = ByteWriter::new();
        tx.write(&mut writer);
        let bytes = writer.into_inner();

        let mut reader = ByteReader::new(&bytes[..bytes.len() - 3]);
        assert!(Transaction::read(&mut reader).is_err());
    }
}
