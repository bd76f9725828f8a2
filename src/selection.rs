//! Coin selection: picking a subset of UTXOs whose sum lands in a target
//! range, used when constructing an on-chain payment (e.g. satisfying a
//! `min-coins` policy's underlying wallet balance, or funding a `sendToAddress`
//! call) without pulling in every UTXO the wallet owns.

/// Sort candidates ascending by amount and greedily accumulate until the
/// running sum falls in `[min, max]`, capped at `max_inputs` UTXOs. Returns
/// `None` if the sum overshoots `max` before reaching `min`, or if
/// `max_inputs` is exhausted first.
pub fn inputs_in_range(
    utxos: &[(String, i64)],
    min: i64,
    max: i64,
    max_inputs: usize,
) -> Option<Vec<String>> {
    let mut sorted: Vec<&(String, i64)> = utxos.iter().collect();
    sorted.sort_by_key(|(_, amount)| *amount);

    let mut selected = Vec::new();
    let mut sum: i64 = 0;
    for (addr, amount) in sorted {
        if selected.len() >= max_inputs {
            break;
        }
        selected.push(addr.clone());
        sum += amount;
        if sum > max {
            return None;
        }
        if sum >= min {
            return Some(selected);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utxos() -> Vec<(String, i64)> {
        vec![
            ("a".to_string(), 100),
            ("b".to_string(), 200),
            ("c".to_string(), 300),
            ("d".to_string(), 300),
        ]
    }

    #[test]
    fn two_inputs_finds_the_minimal_pair() {
        let got = inputs_in_range(&utxos(), 150, 350, 2).unwrap();
        assert_eq!(got, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn three_inputs_still_succeeds() {
        assert!(inputs_in_range(&utxos(), 150, 350, 3).is_some());
    }

    #[test]
    fn one_input_is_not_enough() {
        assert!(inputs_in_range(&utxos(), 150, 350, 1).is_none());
    }

    #[test]
    fn overshoot_fails() {
        assert!(inputs_in_range(&[("a".into(), 1000)], 10, 20, 1).is_none());
    }
}
