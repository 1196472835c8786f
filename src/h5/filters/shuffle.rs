//! Byte shuffle filter

use bytes::Bytes;

/// Decode the byte shuffle filter.
///
/// The filter stores the first byte of every element, then the second byte of every element,
/// and so on. Bytes beyond the last whole element are stored unshuffled at the end.
///
/// # Arguments
///
/// * `data`: `Bytes` to deshuffle.
/// * `element_size`: Size of each element in bytes.
// Benchmarking showed that the "slow" vector initialisation was faster for the non-unrolled case.
#[allow(clippy::slow_vector_initialization)]
pub fn deshuffle(data: &Bytes, element_size: usize) -> Bytes {
    if element_size <= 1 || data.len() < element_size {
        return data.clone();
    }
    let num_elements = data.len() / element_size;
    let shuffled = num_elements * element_size;
    let mut result = Vec::with_capacity(data.len());
    result.resize(shuffled, 0);
    let m = result.as_mut_slice();
    // Unroll the inner loop for the common element sizes.
    let mut dest_index = 0;
    if element_size == 4 {
        for i in 0..num_elements {
            m[dest_index] = data[i];
            m[dest_index + 1] = data[i + num_elements];
            m[dest_index + 2] = data[i + 2 * num_elements];
            m[dest_index + 3] = data[i + 3 * num_elements];
            dest_index += 4;
        }
    } else if element_size == 8 {
        for i in 0..num_elements {
            m[dest_index] = data[i];
            m[dest_index + 1] = data[i + num_elements];
            m[dest_index + 2] = data[i + 2 * num_elements];
            m[dest_index + 3] = data[i + 3 * num_elements];
            m[dest_index + 4] = data[i + 4 * num_elements];
            m[dest_index + 5] = data[i + 5 * num_elements];
            m[dest_index + 6] = data[i + 6 * num_elements];
            m[dest_index + 7] = data[i + 7 * num_elements];
            dest_index += 8;
        }
    } else {
        for i in 0..num_elements {
            let mut src_index = i;
            for _ in 0..element_size {
                m[dest_index] = data[src_index];
                src_index += num_elements;
                dest_index += 1;
            }
        }
    }
    result.extend_from_slice(&data[shuffled..]);
    result.into()
}
