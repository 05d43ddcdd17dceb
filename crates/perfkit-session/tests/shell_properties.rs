//! Property-based tests for the shell buffer.
//!
//! Uses proptest to generate random append sequences and verify fence and
//! trim invariants.

use proptest::prelude::*;

use perfkit_core::ShellSettings;
use perfkit_session::ShellBuffer;

/// Generate water marks with low < high.
fn water_marks() -> impl Strategy<Value = (usize, usize)> {
    (2usize..256).prop_flat_map(|high| (1usize..high, Just(high)))
}

/// Generate a sequence of output chunks.
fn chunks() -> impl Strategy<Value = Vec<Vec<u8>>> {
    prop::collection::vec(prop::collection::vec(any::<u8>(), 0..64), 0..40)
}

proptest! {
    /// The fence equals the total number of bytes ever appended.
    #[test]
    fn fence_counts_every_byte((low, high) in water_marks(), chunks in chunks()) {
        let mut buffer = ShellBuffer::with_settings(&ShellSettings {
            high_water_bytes: high,
            low_water_bytes: low,
        });
        let mut total = 0u64;
        for chunk in &chunks {
            buffer.append(chunk);
            total += chunk.len() as u64;
            prop_assert_eq!(buffer.fence(), total);
        }
    }

    /// Retained length never exceeds the high-water mark.
    #[test]
    fn retained_stays_under_high_water((low, high) in water_marks(), chunks in chunks()) {
        let mut buffer = ShellBuffer::with_settings(&ShellSettings {
            high_water_bytes: high,
            low_water_bytes: low,
        });
        for chunk in &chunks {
            buffer.append(chunk);
            prop_assert!(buffer.len() <= high);
        }
    }

    /// The retained window is always the tail of everything appended.
    #[test]
    fn retained_is_suffix_of_stream((low, high) in water_marks(), chunks in chunks()) {
        let mut buffer = ShellBuffer::with_settings(&ShellSettings {
            high_water_bytes: high,
            low_water_bytes: low,
        });
        let mut stream = Vec::new();
        for chunk in &chunks {
            buffer.append(chunk);
            stream.extend_from_slice(chunk);
        }
        prop_assert!(stream.ends_with(buffer.contents()));
    }

    /// Reading from successive fences yields each byte at most once, and
    /// every byte when nothing was trimmed in between.
    #[test]
    fn fence_reads_never_repeat((low, high) in water_marks(), chunks in chunks()) {
        let mut buffer = ShellBuffer::with_settings(&ShellSettings {
            high_water_bytes: high,
            low_water_bytes: low,
        });
        let mut fence = 0u64;
        let mut seen = Vec::new();
        let mut skipped = 0u64;
        let mut stream = Vec::new();

        for chunk in &chunks {
            buffer.append(chunk);
            stream.extend_from_slice(chunk);
            let read = buffer.read_since(fence);
            seen.extend_from_slice(read.bytes);
            skipped += read.skipped;
            fence = read.fence;
        }

        prop_assert_eq!(seen.len() as u64 + skipped, stream.len() as u64);
        if skipped == 0 {
            prop_assert_eq!(seen, stream);
        }
    }
}
