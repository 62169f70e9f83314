use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};

pub(crate) const STATE_LEN: usize = 32;

/// Random anti-CSRF `state` value.
pub(crate) fn random_state(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_is_alphanumeric_and_unique() {
        let first = random_state(STATE_LEN);
        let second = random_state(STATE_LEN);
        assert_eq!(first.len(), STATE_LEN);
        assert!(first.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(first, second);
    }
}
