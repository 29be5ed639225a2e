// Property: a 2xx GET response fetched by any strategy is stored byte-identical,
// and a non-2xx response never changes the primary partition.

use async_trait::async_trait;
use std::sync::Arc;
use proptest::prelude::*;
use washcache::{
    CacheStore, Fetcher, InterceptedRequest, MemoryCacheStore, OfflineMetrics, ResponseSnapshot,
    Strategy as Policy, StrategyExecutor,
};

const PARTITION: &str = "autolavaggio-cache-v1";

/// Answers every request with the same response
struct FixedFetcher(ResponseSnapshot);

#[async_trait]
impl Fetcher for FixedFetcher {
    async fn fetch(&self, _request: &InterceptedRequest) -> washcache::Result<ResponseSnapshot> {
        Ok(self.0.clone())
    }
}

fn executor(store: Arc<MemoryCacheStore>, response: ResponseSnapshot) -> StrategyExecutor {
    StrategyExecutor::new(
        store,
        Arc::new(FixedFetcher(response)),
        PARTITION,
        OfflineMetrics::new().unwrap(),
    )
}

fn any_policy() -> impl Strategy<Value = Policy> {
    prop_oneof![
        Just(Policy::CacheFirst),
        Just(Policy::NetworkFirst),
        Just(Policy::StaleWhileRevalidate),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// A successful response is cached exactly as received
    #[test]
    fn prop_success_cached_byte_identical(
        segment in "[a-z]{1,12}",
        status in 200u16..300u16,
        body in prop::collection::vec(any::<u8>(), 0..4096),
        content_type in "(text/html|text/css|application/json|image/png)",
        policy in any_policy(),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let store = Arc::new(MemoryCacheStore::new());
            let response = ResponseSnapshot::new(status, body.clone())
                .with_header("content-type", content_type.clone());
            let executor = executor(store.clone(), response.clone());
            let request = InterceptedRequest::get(&format!("http://localhost/{}/", segment)).unwrap();

            let served = executor.execute(policy, &request).await.unwrap();
            if let Some(handle) = served.revalidation {
                handle.await.unwrap();
            }
            prop_assert_eq!(&served.response, &response);

            let cached = store.get(PARTITION, &request.cache_key()).await.unwrap();
            prop_assert_eq!(cached, Some(response));
            Ok(())
        })?;
    }

    /// A non-2xx response is returned to the caller and leaves the cache as it was
    #[test]
    fn prop_error_status_leaves_cache_unchanged(
        segment in "[a-z]{1,12}",
        status in prop_oneof![300u16..400u16, 400u16..600u16],
        preexisting in any::<bool>(),
        policy in any_policy(),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async {
            let store = Arc::new(MemoryCacheStore::new());
            let request = InterceptedRequest::get(&format!("http://localhost/{}/", segment)).unwrap();
            let original = ResponseSnapshot::new(200, "cached copy");
            if preexisting {
                store.put(PARTITION, &request.cache_key(), original.clone()).await.unwrap();
            }

            let executor = executor(store.clone(), ResponseSnapshot::new(status, "error"));
            let served = executor.execute(policy, &request).await.unwrap();
            if let Some(handle) = served.revalidation {
                handle.await.unwrap();
            }

            let cached = store.get(PARTITION, &request.cache_key()).await.unwrap();
            if preexisting {
                prop_assert_eq!(cached, Some(original));
            } else {
                prop_assert_eq!(cached, None);
                prop_assert_eq!(served.response.status, status);
            }
            Ok(())
        })?;
    }
}
