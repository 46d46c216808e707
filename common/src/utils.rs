//! Common Utilities
//!
//! Resource-block arithmetic shared by the scheduler stages (TS 36.211 / 36.213)

use tracing::trace;

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Integer division rounding up
pub fn ceil_div(num: u32, den: u32) -> u32 {
    num / den + u32::from(num % den != 0)
}

/// PUSCH allocations must span 2^a * 3^b * 5^c PRBs (TS 36.211 5.3.3)
pub fn is_valid_ul_nof_prb(nof_prb: u16) -> bool {
    if nof_prb == 0 {
        return false;
    }
    let mut n = nof_prb;
    for factor in [2, 3, 5] {
        while n % factor == 0 {
            n /= factor;
        }
    }
    n == 1
}

/// Largest valid PUSCH PRB count not above `nof_prb`
pub fn round_down_ul_nof_prb(nof_prb: u16) -> u16 {
    let mut n = nof_prb;
    while n > 0 && !is_valid_ul_nof_prb(n) {
        n -= 1;
    }
    if n != nof_prb {
        trace!("Rounded UL allocation of {} PRBs down to {}", nof_prb, n);
    }
    n
}

/// Resource block group size P for type 0 allocation (TS 36.213 Table 7.1.6.1-1)
pub fn rbg_size(cell_nof_prb: u16) -> u16 {
    match cell_nof_prb {
        0..=10 => 1,
        11..=26 => 2,
        27..=63 => 3,
        _ => 4,
    }
}

/// Number of RBGs in the cell; the last group may be smaller than P
pub fn nof_rbg(cell_nof_prb: u16) -> u16 {
    ceil_div(cell_nof_prb as u32, rbg_size(cell_nof_prb) as u32) as u16
}

/// Number of PRBs in the given RBG
pub fn rbg_nof_prb(cell_nof_prb: u16, rbg: u16) -> u16 {
    let p = rbg_size(cell_nof_prb);
    let start = rbg * p;
    if start >= cell_nof_prb {
        0
    } else {
        p.min(cell_nof_prb - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_hex() {
        let data = vec![0x12, 0x34, 0xAB, 0xCD];
        assert_eq!(bytes_to_hex(&data), "12 34 ab cd");
    }

    #[test]
    fn test_ceil_div() {
        assert_eq!(ceil_div(0, 4), 0);
        assert_eq!(ceil_div(9, 4), 3);
        assert_eq!(ceil_div(8, 4), 2);
        assert_eq!(ceil_div(u32::MAX, 2), u32::MAX / 2 + 1);
    }

    #[test]
    fn test_ul_prb_counts() {
        assert!(is_valid_ul_nof_prb(1));
        assert!(is_valid_ul_nof_prb(12));
        assert!(is_valid_ul_nof_prb(75));
        assert!(!is_valid_ul_nof_prb(7));
        assert!(!is_valid_ul_nof_prb(0));
        assert_eq!(round_down_ul_nof_prb(23), 20);
        assert_eq!(round_down_ul_nof_prb(14), 12);
        assert_eq!(round_down_ul_nof_prb(0), 0);
    }

    #[test]
    fn test_rbg_layout() {
        assert_eq!(rbg_size(6), 1);
        assert_eq!(rbg_size(25), 2);
        assert_eq!(rbg_size(50), 3);
        assert_eq!(rbg_size(100), 4);
        assert_eq!(nof_rbg(25), 13);
        assert_eq!(rbg_nof_prb(25, 12), 1);
        assert_eq!(rbg_nof_prb(25, 0), 2);
        assert_eq!(nof_rbg(50), 17);
        assert_eq!(rbg_nof_prb(50, 16), 2);
    }
}
