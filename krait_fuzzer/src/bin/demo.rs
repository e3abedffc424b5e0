//! Demo target: a tiny chunked-record decoder with a planted bounds bug.
//!
//! ```text
//! cargo run --bin demo -- fuzz seeds/
//! cargo run --bin demo -- show
//! ```

use krait_core::trace;

/// Record stream: repeated `[kind: u8][len: u8][body: len bytes]`.
/// `R` records are checksummed, `P` records are padding and skipped.
fn decode(data: &[u8]) {
    trace::cov_hit(1);
    let mut offset = 0;
    let mut checksum = 0u32;
    while offset + 2 <= data.len() {
        trace::cov_hit(2);
        let kind = data[offset];
        let len = data[offset + 1] as usize;
        offset += 2;
        match kind {
            b'R' => {
                trace::cov_hit(3);
                // Planted bug: `len` is trusted, so a record promising more
                // bytes than the stream holds panics on the slice below.
                let body = &data[offset..offset + len];
                checksum = body.iter().fold(checksum, |acc, &b| {
                    trace::cov_hit(4 + (b & 1) as u64);
                    acc.wrapping_mul(31).wrapping_add(b as u32)
                });
                offset += len;
            }
            b'P' => {
                trace::cov_hit(6);
                offset = offset.saturating_add(len).min(data.len());
            }
            _ => {
                trace::cov_hit(7);
                break;
            }
        }
    }
    if checksum == 0xdead_beef {
        trace::cov_hit(8);
    }
}

fn main() {
    krait_fuzzer::fuzz_main(decode);
}
