//! Property-based checks over the pure helpers the fetchers and the queue
//! runner lean on.

use proptest::prelude::*;

use attribution_pipeline::fetcher::util::{
    base_origin, is_valid_aggregate_key_piece, parse_unsigned_long, top_private_domain_and_scheme,
};
use attribution_pipeline::models::{KeyValueData, KeyValueDataType, RedirectType, Redirects};

proptest! {
    /// Property: every u64 survives a format/parse round trip.
    #[test]
    fn unsigned_long_round_trips(value in any::<u64>()) {
        prop_assert_eq!(parse_unsigned_long(&value.to_string()), Some(value));
    }

    /// Property: strings containing a letter never parse as unsigned longs.
    #[test]
    fn unsigned_long_rejects_letters(prefix in "[0-9]{0,5}", letter in "[a-zA-Z]", suffix in "[0-9]{0,5}") {
        let value = format!("{prefix}{letter}{suffix}");
        prop_assert_eq!(parse_unsigned_long(&value), None);
    }

    /// Property: values beyond the u64 range are rejected, not wrapped.
    #[test]
    fn unsigned_long_rejects_overflow(excess in 1u64..1_000_000) {
        let value = u64::MAX as u128 + u128::from(excess);
        prop_assert_eq!(parse_unsigned_long(&value.to_string()), None);
    }

    /// Property: reducing to a base origin is idempotent.
    #[test]
    fn base_origin_is_idempotent(host in "[a-z]{1,10}(\\.[a-z]{1,10}){0,2}", path in "[a-z]{0,8}") {
        let uri = format!("https://{host}/{path}");
        let origin = base_origin(&uri).unwrap();
        prop_assert_eq!(base_origin(&origin), Some(origin.clone()));
        prop_assert!(origin.ends_with(&host));
    }

    /// Property: subdomains collapse to the registrable domain. The label
    /// carries a fixed prefix so it can never collide with a public-suffix
    /// entry of its own.
    #[test]
    fn top_private_domain_strips_subdomains(sub in "[a-z]{1,10}", label in "[a-z]{0,6}") {
        let uri = format!("https://{sub}.shop{label}.com/page");
        prop_assert_eq!(
            top_private_domain_and_scheme(&uri),
            Some(format!("https://shop{label}.com"))
        );
    }

    /// Property: the redirect accumulator never holds more entries than
    /// were pushed, and duplicates within a type collapse.
    #[test]
    fn redirect_accumulator_deduplicates(uris in prop::collection::vec("[a-z]{1,6}", 0..20)) {
        let mut redirects = Redirects::new();
        for uri in &uris {
            redirects.push(RedirectType::List, format!("https://{uri}.test"));
        }
        prop_assert!(redirects.len() <= uris.len());
        let distinct: std::collections::HashSet<&String> = uris.iter().collect();
        prop_assert_eq!(redirects.len(), distinct.len());
    }

    /// Property: the redirect counter round-trips through its string store.
    #[test]
    fn redirect_count_round_trips(count in 1u32..10_000) {
        let mut data = KeyValueData {
            data_type: KeyValueDataType::RegistrationRedirectCount,
            key: "group".to_string(),
            value: None,
        };
        prop_assert_eq!(data.registration_redirect_count(), 1);
        data.set_registration_redirect_count(count);
        prop_assert_eq!(data.registration_redirect_count(), count);
    }

    /// Property: hex key pieces validate independent of digit case.
    #[test]
    fn aggregate_key_piece_case_insensitive(digits in "[0-9a-f]{1,32}") {
        let lower = format!("0x{digits}");
        let upper = format!("0x{}", digits.to_uppercase());
        prop_assert!(is_valid_aggregate_key_piece(&lower));
        prop_assert!(is_valid_aggregate_key_piece(&upper));
    }
}
