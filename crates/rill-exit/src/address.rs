//! Address decoding for register requests.
//!
//! Rill addresses are Bech32m strings (`rill1…` on mainnet, `trill1…` on
//! testnet) carrying a version byte and the 32-byte account pubkey hash.
//! Register requests may also name an account directly by its 64-char hex id.

use serde::{Deserialize, Serialize};

use crate::error::AddressError;
use crate::types::{AccountId, Hash256};

const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
const BECH32M_CONST: u32 = 0x2bc8_30a3;
const CHECKSUM_LEN: usize = 6;

pub const ADDRESS_VERSION: u8 = 0;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn hrp(&self) -> &'static str {
        match self {
            Network::Mainnet => "rill",
            Network::Testnet => "trill",
        }
    }

    fn from_hrp(hrp: &str) -> Result<Self, AddressError> {
        match hrp {
            "rill" => Ok(Network::Mainnet),
            "trill" => Ok(Network::Testnet),
            other => Err(AddressError::UnknownNetwork(other.to_string())),
        }
    }
}

/// Parse one register key: a raw hex account id or an address on `network`.
pub fn parse_account(key: &str, network: Network) -> Result<AccountId, AddressError> {
    if let Some(hash) = Hash256::from_hex(key) {
        return Ok(AccountId(hash));
    }
    decode_address(key, network)
}

/// Decode a Bech32m address, requiring it to belong to `network`.
pub fn decode_address(s: &str, network: Network) -> Result<AccountId, AddressError> {
    if s.bytes().any(|b| b.is_ascii_lowercase()) && s.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(AddressError::MixedCase);
    }
    let s = s.to_ascii_lowercase();
    let sep = s.rfind('1').ok_or(AddressError::MissingSeparator)?;
    let (hrp, data_part) = (&s[..sep], &s[sep + 1..]);
    if hrp.is_empty() || data_part.len() < CHECKSUM_LEN + 1 {
        return Err(AddressError::InvalidLength);
    }

    let values = data_part
        .chars()
        .map(|c| {
            CHARSET
                .iter()
                .position(|&ch| ch as char == c)
                .map(|p| p as u8)
                .ok_or(AddressError::InvalidCharacter(c))
        })
        .collect::<Result<Vec<u8>, _>>()?;

    let mut check = hrp_expand(hrp);
    check.extend_from_slice(&values);
    if polymod(&check) != BECH32M_CONST {
        return Err(AddressError::InvalidChecksum);
    }

    if Network::from_hrp(hrp)? != network {
        return Err(AddressError::WrongNetwork {
            expected: network.hrp(),
        });
    }

    let payload = &values[..values.len() - CHECKSUM_LEN];
    let (&version, data) = payload.split_first().ok_or(AddressError::InvalidLength)?;
    if version != ADDRESS_VERSION {
        return Err(AddressError::InvalidVersion(version));
    }
    let bytes = regroup(data, 5, 8, false).ok_or(AddressError::InvalidPadding)?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| AddressError::InvalidLength)?;
    Ok(AccountId::from_bytes(arr))
}

/// Encode an account id as an address on `network`.
pub fn encode_address(id: &AccountId, network: Network) -> String {
    let hrp = network.hrp();
    let mut payload = vec![ADDRESS_VERSION];
    // 8-to-5 regrouping with padding cannot fail.
    payload.extend(regroup(id.as_bytes(), 8, 5, true).unwrap_or_default());

    let mut check = hrp_expand(hrp);
    check.extend_from_slice(&payload);
    check.extend_from_slice(&[0; CHECKSUM_LEN]);
    let pm = polymod(&check) ^ BECH32M_CONST;

    let mut out = String::with_capacity(hrp.len() + 1 + payload.len() + CHECKSUM_LEN);
    out.push_str(hrp);
    out.push('1');
    for v in payload {
        out.push(CHARSET[v as usize] as char);
    }
    for i in 0..CHECKSUM_LEN {
        let v = (pm >> (5 * (CHECKSUM_LEN - 1 - i))) & 31;
        out.push(CHARSET[v as usize] as char);
    }
    out
}

fn polymod(values: &[u8]) -> u32 {
    const GEN: [u32; 5] = [0x3b6a_57b2, 0x2650_8e6d, 0x1ea1_19fa, 0x3d42_33dd, 0x2a14_62b3];
    values.iter().fold(1u32, |chk, &v| {
        let top = chk >> 25;
        let mut next = ((chk & 0x01ff_ffff) << 5) ^ u32::from(v);
        for (i, g) in GEN.iter().enumerate() {
            if (top >> i) & 1 == 1 {
                next ^= g;
            }
        }
        next
    })
}

fn hrp_expand(hrp: &str) -> Vec<u8> {
    hrp.bytes()
        .map(|b| b >> 5)
        .chain(std::iter::once(0))
        .chain(hrp.bytes().map(|b| b & 31))
        .collect()
}

fn regroup(data: &[u8], from: u32, to: u32, pad: bool) -> Option<Vec<u8>> {
    let mut acc = 0u32;
    let mut bits = 0u32;
    let mask = (1u32 << to) - 1;
    let mut out = Vec::with_capacity(data.len() * from as usize / to as usize + 1);
    for &value in data {
        if u32::from(value) >> from != 0 {
            return None;
        }
        acc = (acc << from) | u32::from(value);
        bits += from;
        while bits >= to {
            bits -= to;
            out.push(((acc >> bits) & mask) as u8);
        }
    }
    if pad {
        if bits > 0 {
            out.push(((acc << (to - bits)) & mask) as u8);
        }
    } else if bits >= from || ((acc << (to - bits)) & mask) != 0 {
        return None;
    }
    Some(out)
}
