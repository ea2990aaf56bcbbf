//! Prefix compression for streamed term lists: each item is sent as
//! `{reuse: u8, suffix}` where `reuse` bytes are shared with the
//! previous item (clamped to 255) and `suffix` is the rest.

/// Stateful encoder; feed items in list order.
#[derive(Default)]
pub struct PrefixEncoder {
    prev: Vec<u8>,
}

impl PrefixEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the `{reuse, suffix}` pair for the next item.
    pub fn encode(&mut self, value: &[u8]) -> (u8, Vec<u8>) {
        let common = self
            .prev
            .iter()
            .zip(value)
            .take_while(|(a, b)| a == b)
            .count()
            .min(255);
        let suffix = value[common..].to_vec();
        self.prev.clear();
        self.prev.extend_from_slice(value);
        (common as u8, suffix)
    }
}

/// Stateful decoder; the inverse of [`PrefixEncoder`].
#[derive(Default)]
pub struct PrefixDecoder {
    prev: Vec<u8>,
}

impl PrefixDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, reuse: u8, suffix: &[u8]) -> Vec<u8> {
        self.prev.truncate(reuse as usize);
        self.prev.extend_from_slice(suffix);
        self.prev.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_scenario_framing() {
        let terms: [&[u8]; 5] = [b"a", b"ab", b"abc", b"abd", b"ac"];
        let mut encoder = PrefixEncoder::new();
        let frames: Vec<_> = terms.iter().map(|t| encoder.encode(t)).collect();
        let expected: [(u8, &[u8]); 5] = [
            (0, b"a"),
            (1, b"b"),
            (2, b"c"),
            (2, b"d"),
            (1, b"c"),
        ];
        for ((reuse, suffix), (want_reuse, want_suffix)) in frames.iter().zip(&expected) {
            assert_eq!(reuse, want_reuse);
            assert_eq!(&suffix[..], *want_suffix);
        }
    }

    #[test]
    fn inverse_reconstructs_any_list() {
        let lists: Vec<Vec<Vec<u8>>> = vec![
            vec![],
            vec![b"".to_vec(), b"".to_vec()],
            vec![b"same".to_vec(), b"same".to_vec(), b"samey".to_vec()],
            vec![vec![0u8; 300], vec![0u8; 400], b"unrelated".to_vec()],
        ];
        for list in lists {
            let mut encoder = PrefixEncoder::new();
            let mut decoder = PrefixDecoder::new();
            let decoded: Vec<Vec<u8>> = list
                .iter()
                .map(|item| {
                    let (reuse, suffix) = encoder.encode(item);
                    decoder.decode(reuse, &suffix)
                })
                .collect();
            assert_eq!(decoded, list);
        }
    }

    #[test]
    fn reuse_clamps_at_255() {
        let long = vec![7u8; 400];
        let mut longer = long.clone();
        longer.push(8);
        let mut encoder = PrefixEncoder::new();
        encoder.encode(&long);
        let (reuse, suffix) = encoder.encode(&longer);
        assert_eq!(reuse, 255);
        assert_eq!(suffix.len(), longer.len() - 255);
    }
}
