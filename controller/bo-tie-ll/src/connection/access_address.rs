//! Access address generation
//!
//! Every connection uses a random access address chosen by the master. An access address is only
//! valid if it cannot be mistaken for the advertising access address and has enough bit transitions
//! for the receiver to synchronize on.

use rand_core::RngCore;

/// The access address of the advertising channels
pub const ADVERTISING_ACCESS_ADDRESS: u32 = 0x8E89BED6;

fn transitions(bits: u32, width: u32) -> u32 {
    let pairs = bits ^ (bits >> 1);

    (pairs & ((1 << (width - 1)) - 1)).count_ones()
}

fn longest_run(aa: u32) -> u32 {
    let mut longest = 1;
    let mut run = 1;

    for bit in 1..32 {
        if (aa >> bit) & 1 == (aa >> (bit - 1)) & 1 {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 1;
        }
    }

    longest
}

/// Check if `aa` may be used as the access address of a connection
pub fn is_valid(aa: u32) -> bool {
    let octets = aa.to_le_bytes();

    aa != ADVERTISING_ACCESS_ADDRESS
        && (aa ^ ADVERTISING_ACCESS_ADDRESS).count_ones() > 1
        && !octets.iter().all(|octet| *octet == octets[0])
        && longest_run(aa) <= 6
        && transitions(aa, 32) <= 24
        && transitions(aa >> 26, 6) >= 2
}

/// Generate a random access address
pub fn generate<R: RngCore>(rng: &mut R) -> u32 {
    loop {
        let aa = rng.next_u32();

        if is_valid(aa) {
            break aa;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn rejected_addresses() {
        assert!(!is_valid(ADVERTISING_ACCESS_ADDRESS));

        // differs from the advertising access address by one bit
        assert!(!is_valid(ADVERTISING_ACCESS_ADDRESS ^ (1 << 9)));

        // four equal octets
        assert!(!is_valid(0x5A5A5A5A));

        // eight consecutive zeros
        assert!(!is_valid(0x5A01_5A5A));

        // too many transitions
        assert!(!is_valid(0xAAAA_AA55));

        // the six most significant bits have no transition
        assert!(!is_valid(0xFC5A_3C96));
    }

    #[test]
    fn generated_addresses_are_valid() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        for _ in 0..500 {
            assert!(is_valid(generate(&mut rng)));
        }

        assert!(is_valid(0x50654AD7));
    }
}
