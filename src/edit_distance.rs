// Banded edit distance - single authoritative implementation.
//
// Myers' bit-parallel DP restricted to a diagonal band of 2e+1 diagonals,
// held in one 32-bit word (configuration rejects 2e+1 > 31). `banded_align`
// reports the minimum edit distance and the alignment end position inside the
// verification window; `banded_traceback` recovers the start position for a
// known error count by running the same DP over the reversed window and read.

use crate::sequence_batch::char_to_uint8;

/// Align `text` (the read) against the window `pattern`, whose length must be
/// at least `text.len() + 2e`. Returns `(num_errors, end_position)` where
/// `end_position` indexes into `pattern`. `num_errors == e + 1` means the
/// candidate is over threshold and `end_position` is meaningless.
pub fn banded_align(pattern: &[u8], text: &[u8], error_threshold: i32) -> (i32, i32) {
    let e = error_threshold as usize;
    let read_length = text.len();
    debug_assert!(pattern.len() >= read_length + 2 * e);

    // Equality masks for the five base codes over the initial 2e window
    // prefix. N contributes no equality bit on either side, so it always
    // scores a mismatch.
    let mut peq = [0u32; 5];
    for (i, &base) in pattern.iter().take(2 * e).enumerate() {
        let code = char_to_uint8(base) as usize;
        if code < 4 {
            peq[code] |= 1 << i;
        }
    }

    let highest_bit_in_band_mask: u32 = 1 << (2 * e);
    let lowest_bit_in_band_mask: u32 = 1;
    let mut vp: u32 = 0;
    let mut vn: u32 = 0;
    let mut num_errors_at_band_start_position: i32 = 0;

    for i in 0..read_length {
        let pattern_base = char_to_uint8(pattern[i + 2 * e]) as usize;
        if pattern_base < 4 {
            peq[pattern_base] |= highest_bit_in_band_mask;
        }
        let mut x = peq[char_to_uint8(text[i]) as usize] | vn;
        let d0 = ((vp.wrapping_add(x & vp)) ^ vp) | x;
        let hn = vp & d0;
        let hp = vn | !(vp | d0);
        x = d0 >> 1;
        vn = x & hp;
        vp = hn | !(x | hp);
        num_errors_at_band_start_position += 1 - (d0 & lowest_bit_in_band_mask) as i32;
        if num_errors_at_band_start_position > 3 * error_threshold {
            return (error_threshold + 1, 0);
        }
        for mask in peq.iter_mut() {
            *mask >>= 1;
        }
    }

    // Walk the final band from its start diagonal, adjusting the error count
    // one diagonal at a time, and keep the minimum.
    let band_start_position = read_length as i32 - 1;
    let mut min_num_errors = num_errors_at_band_start_position;
    let mut mapping_end_position = band_start_position;
    for i in 0..2 * e {
        num_errors_at_band_start_position += ((vp >> i) & 1) as i32;
        num_errors_at_band_start_position -= ((vn >> i) & 1) as i32;
        if num_errors_at_band_start_position < min_num_errors {
            min_num_errors = num_errors_at_band_start_position;
            mapping_end_position = band_start_position + 1 + i as i32;
        }
    }
    (min_num_errors, mapping_end_position)
}

/// Recover the alignment start position inside `pattern` for an alignment
/// known to have `min_num_errors` errors. The gapless case is answered by a
/// Hamming scan; otherwise the band is rerun over the reversed sequences and
/// the start falls out of the final diagonal walk.
pub fn banded_traceback(
    min_num_errors: i32,
    pattern: &[u8],
    text: &[u8],
    error_threshold: i32,
) -> i32 {
    let e = error_threshold as usize;
    let read_length = text.len();
    debug_assert!(pattern.len() >= read_length + 2 * e);

    if min_num_errors == 0 {
        return error_threshold;
    }
    let mut error_count = 0;
    for i in 0..read_length {
        let pattern_code = char_to_uint8(pattern[i + e]);
        let text_code = char_to_uint8(text[i]);
        if pattern_code != text_code || pattern_code == 4 {
            error_count += 1;
        }
    }
    if error_count == min_num_errors {
        return error_threshold;
    }

    // Gaps shifted the alignment off the central diagonal; align the
    // reversed read against the reversed window.
    let mut peq = [0u32; 5];
    for i in 0..2 * e {
        let code = char_to_uint8(pattern[read_length - 1 + 2 * e - i]) as usize;
        if code < 4 {
            peq[code] |= 1 << i;
        }
    }
    let highest_bit_in_band_mask: u32 = 1 << (2 * e);
    let lowest_bit_in_band_mask: u32 = 1;
    let mut vp: u32 = 0;
    let mut vn: u32 = 0;
    let mut num_errors_at_band_start_position: i32 = 0;
    for i in 0..read_length {
        let pattern_base = char_to_uint8(pattern[read_length - 1 - i]) as usize;
        if pattern_base < 4 {
            peq[pattern_base] |= highest_bit_in_band_mask;
        }
        let mut x = peq[char_to_uint8(text[read_length - 1 - i]) as usize] | vn;
        let d0 = ((vp.wrapping_add(x & vp)) ^ vp) | x;
        let hn = vp & d0;
        let hp = vn | !(vp | d0);
        x = d0 >> 1;
        vn = x & hp;
        vp = hn | !(x | hp);
        num_errors_at_band_start_position += 1 - (d0 & lowest_bit_in_band_mask) as i32;
        for mask in peq.iter_mut() {
            *mask >>= 1;
        }
    }
    let mut mapping_start_position = 2 * error_threshold;
    for i in 0..2 * e {
        num_errors_at_band_start_position += ((vp >> i) & 1) as i32;
        num_errors_at_band_start_position -= ((vn >> i) & 1) as i32;
        if num_errors_at_band_start_position == min_num_errors {
            mapping_start_position = 2 * error_threshold - (1 + i as i32);
        }
    }
    mapping_start_position
}

#[cfg(test)]
mod tests {
    use super::*;

    const E: i32 = 3;

    fn window_for(read: &[u8]) -> Vec<u8> {
        // Distinct flanks so the only sub-threshold alignment is the read
        // itself.
        let mut window = Vec::new();
        window.extend_from_slice(b"GGG");
        window.extend_from_slice(read);
        window.extend_from_slice(b"GGG");
        window
    }

    #[test]
    fn test_exact_match() {
        let read = b"ACTCACTTACGTCATCACTT";
        let window = window_for(read);
        let (num_errors, end_position) = banded_align(&window, read, E);
        assert_eq!(num_errors, 0);
        assert_eq!(end_position, read.len() as i32 - 1 + E);
        let start = banded_traceback(num_errors, &window, read, E);
        assert_eq!(start, E);
    }

    #[test]
    fn test_single_substitution() {
        let read = b"ACTCACTTACGTCATCACTT";
        let window = window_for(read);
        let mut mutated = read.to_vec();
        mutated[10] = b'A'; // G -> A
        let (num_errors, end_position) = banded_align(&window, &mutated, E);
        assert_eq!(num_errors, 1);
        assert_eq!(end_position, read.len() as i32 - 1 + E);
        let start = banded_traceback(num_errors, &window, &mutated, E);
        assert_eq!(start, E);
    }

    #[test]
    fn test_single_deletion_in_read() {
        let read = b"ACTCACTTACGTCATCACTT";
        let window = window_for(read);
        // Read is missing one reference base.
        let mut shortened = read.to_vec();
        shortened.remove(10);
        let (num_errors, end_position) = banded_align(&window, &shortened, E);
        assert_eq!(num_errors, 1);
        let start = banded_traceback(num_errors, &window, &shortened, E);
        // Start/end bracket an alignment whose reference span is read_len +/- e.
        let span = end_position - start + 1;
        assert!(span >= shortened.len() as i32 - E);
        assert!(span <= shortened.len() as i32 + E);
    }

    #[test]
    fn test_single_insertion_in_read() {
        let read = b"ACTCACTTACGTCATCACTT";
        // The lengthened read needs one extra window base on the right to
        // keep the band inside the pattern.
        let mut window = window_for(read);
        window.push(b'G');
        let mut lengthened = read.to_vec();
        lengthened.insert(10, b'T');
        let (num_errors, end_position) = banded_align(&window, &lengthened, E);
        assert_eq!(num_errors, 1);
        let start = banded_traceback(num_errors, &window, &lengthened, E);
        let span = end_position - start + 1;
        assert!(span >= lengthened.len() as i32 - E);
        assert!(span <= lengthened.len() as i32 + E);
    }

    #[test]
    fn test_over_threshold() {
        let read = b"ACTCACTTACGTCATCACTT";
        let window = window_for(read);
        let unrelated = b"TGAGTGGTTGAGTGGTTGAG";
        let (num_errors, _) = banded_align(&window, unrelated, E);
        assert_eq!(num_errors, E + 1);
    }

    #[test]
    fn test_n_always_mismatches() {
        let read = b"ACTCACTTACGTCATCACTT";
        let window = window_for(read);
        let mut with_n = read.to_vec();
        with_n[5] = b'N';
        let (num_errors, _) = banded_align(&window, &with_n, E);
        assert_eq!(num_errors, 1);
        // N in the window mismatches N in the read as well.
        let mut window_with_n = window.clone();
        window_with_n[5 + E as usize] = b'N';
        let (num_errors, _) = banded_align(&window_with_n, &with_n, E);
        assert_eq!(num_errors, 1);
    }

    #[test]
    fn test_rerunning_reports_identical_errors() {
        let read = b"ACTCACTTACGTCATCACTT";
        let window = window_for(read);
        let mut mutated = read.to_vec();
        mutated[3] = b'T';
        mutated[15] = b'G';
        let first = banded_align(&window, &mutated, E);
        let second = banded_align(&window, &mutated, E);
        assert_eq!(first, second);
        assert_eq!(first.0, 2);
    }
}
