//! Lookups by workload key, falling back to the key older releases registered workloads under.

use std::fmt::Debug;

use tracing::debug;

use crate::datastore::DatastoreError;

/// Runs `op` with `primary`, then with `legacy` if the first attempt found nothing. The legacy attempt is skipped
/// when both keys are the same.
///
/// Errors other than absence are returned immediately. When both keys are absent, the legacy key's error is
/// returned.
pub fn try_keys<K, T, F>(primary: &K, legacy: &K, mut op: F) -> Result<T, DatastoreError>
where
    K: PartialEq + Debug,
    F: FnMut(&K) -> Result<T, DatastoreError>,
{
    match op(primary) {
        Err(err) if err.is_absent() && primary != legacy => {
            debug!("Nothing found for {:?} ({}), trying {:?}", primary, err, legacy);
            op(legacy)
        }
        result => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_hit() {
        let mut tried = Vec::new();
        let result = try_keys(&"a", &"b", |k| {
            tried.push(*k);
            Ok::<_, DatastoreError>(1)
        });
        assert_eq!(result.unwrap(), 1);
        assert_eq!(tried, vec!["a"]);
    }

    #[test]
    fn test_fallback_on_absence() {
        let mut tried = Vec::new();
        let result = try_keys(&"a", &"b", |k| {
            tried.push(*k);
            match *k {
                "a" => Err(DatastoreError::Conflict("a".into())),
                _ => Ok(2),
            }
        });
        assert_eq!(result.unwrap(), 2);
        assert_eq!(tried, vec!["a", "b"]);
    }

    #[test]
    fn test_same_key_tried_once() {
        let mut calls = 0;
        let result: Result<(), _> = try_keys(&"a", &"a", |k| {
            calls += 1;
            Err(DatastoreError::NotFound(k.to_string()))
        });
        assert!(matches!(result, Err(DatastoreError::NotFound(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_other_errors_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = try_keys(&"a", &"b", |k| {
            calls += 1;
            Err(DatastoreError::MultipleEndpointsMatch(k.to_string()))
        });
        assert!(matches!(result, Err(DatastoreError::MultipleEndpointsMatch(_))));
        assert_eq!(calls, 1);
    }
}
