//! Minimal contract ABI encoding for the token and sale calls.

use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use thiserror::Error;

pub const BALANCE_OF: &str = "balanceOf(address)";
pub const PRICE: &str = "price()";
pub const MAX_TOKENS: &str = "maxTokens()";
pub const TOKENS_SOLD: &str = "tokensSold()";
pub const BUY_TOKENS: &str = "buyTokens(uint256)";

const ERROR_STRING_SELECTOR: [u8; 4] = [0x08, 0xc3, 0x79, 0xa0];
const WORD: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AbiError {
    #[error("return data too short: expected {expected} bytes, got {actual}")]
    ShortReturn { expected: usize, actual: usize },
}

pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

pub fn address_word(address: Address) -> B256 {
    address.into_word()
}

pub fn uint_word(value: U256) -> B256 {
    B256::from(value.to_be_bytes::<32>())
}

pub fn encode_call(signature: &str, args: &[B256]) -> Bytes {
    let mut data = Vec::with_capacity(4 + args.len() * WORD);
    data.extend_from_slice(&selector(signature));
    for arg in args {
        data.extend_from_slice(arg.as_slice());
    }
    Bytes::from(data)
}

pub fn decode_uint(data: &[u8]) -> Result<U256, AbiError> {
    if data.len() < WORD {
        return Err(AbiError::ShortReturn {
            expected: WORD,
            actual: data.len(),
        });
    }
    Ok(U256::from_be_slice(&data[..WORD]))
}

/// Best-effort decoding of a standard `Error(string)` revert payload.
pub fn decode_revert_reason(data: &[u8]) -> Option<String> {
    let body = data.strip_prefix(&ERROR_STRING_SELECTOR[..])?;
    let offset = usize::try_from(decode_uint(body).ok()?).ok()?;
    let length_word = body.get(offset..offset.checked_add(WORD)?)?;
    let length = usize::try_from(decode_uint(length_word).ok()?).ok()?;
    let start = offset + WORD;
    let bytes = body.get(start..start.checked_add(length)?)?;
    String::from_utf8(bytes.to_vec()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::address;

    #[test]
    fn selectors_match_known_erc20_signatures() {
        assert_eq!(selector(BALANCE_OF), [0x70, 0xa0, 0x82, 0x31]);
        assert_eq!(selector("transfer(address,uint256)"), [0xa9, 0x05, 0x9c, 0xbb]);
    }

    #[test]
    fn encodes_address_argument_as_left_padded_word() {
        let account = address!("0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
        let data = encode_call(BALANCE_OF, &[address_word(account)]);
        assert_eq!(data.len(), 36);
        assert_eq!(&data[4..16], &[0u8; 12]);
        assert_eq!(&data[16..36], account.as_slice());
    }

    #[test]
    fn decodes_uint_words() {
        let word = uint_word(U256::from(250_000u64));
        assert_eq!(decode_uint(word.as_slice()), Ok(U256::from(250_000u64)));
        assert_eq!(
            decode_uint(&[0u8; 4]),
            Err(AbiError::ShortReturn {
                expected: 32,
                actual: 4
            })
        );
    }

    #[test]
    fn decodes_error_string_revert_payload() {
        let reason = "insufficient ETH";
        let mut data = ERROR_STRING_SELECTOR.to_vec();
        data.extend_from_slice(uint_word(U256::from(32u64)).as_slice());
        data.extend_from_slice(uint_word(U256::from(reason.len())).as_slice());
        let mut padded = reason.as_bytes().to_vec();
        padded.resize(WORD, 0);
        data.extend_from_slice(&padded);

        assert_eq!(decode_revert_reason(&data).as_deref(), Some(reason));
    }

    #[test]
    fn ignores_non_standard_revert_payloads() {
        assert_eq!(decode_revert_reason(&[]), None);
        assert_eq!(decode_revert_reason(&[0xde, 0xad, 0xbe, 0xef]), None);
        assert_eq!(decode_revert_reason(&ERROR_STRING_SELECTOR), None);
    }
}
