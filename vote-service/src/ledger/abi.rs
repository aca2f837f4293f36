//! ABI encoding of the voting contract call
//!
//! The contract exposes `castVote(bytes32 electionId, bytes32 candidateId, address voter)`.
//! Store ids are free-form strings, so each id is committed on chain as the
//! keccak-256 hash of its UTF-8 bytes.

use sha3::{Digest, Keccak256};

use super::types::{Address, VoteCall};

pub const CAST_VOTE_SIGNATURE: &str = "castVote(bytes32,bytes32,address)";

/// Size of one ABI word
const WORD: usize = 32;

pub fn keccak256(bytes: &[u8]) -> [u8; 32] {
    let digest = Keccak256::digest(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// First four bytes of the keccak hash of a function signature
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = keccak256(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// On-chain representation of a store id
pub fn id_to_bytes32(id: &str) -> [u8; 32] {
    keccak256(id.as_bytes())
}

fn address_word(address: &Address) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[WORD - 20..].copy_from_slice(&address.0);
    word
}

/// Calldata for `castVote`
pub fn encode_cast_vote(call: &VoteCall) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 3 * WORD);
    data.extend_from_slice(&selector(CAST_VOTE_SIGNATURE));
    data.extend_from_slice(&id_to_bytes32(&call.election_id));
    data.extend_from_slice(&id_to_bytes32(&call.candidate_id));
    data.extend_from_slice(&address_word(&call.voter));
    data
}
