use std::sync::Arc;
use std::time::Instant;

use lazymap::LazyMap;
use lazymap::LazyMapError;

use rand::Rng;
use tokio_util::sync::CancellationToken;

/// If our factory fails, all our concurrent gets will fail. Let's cause
/// that to happen sometimes by failing on even numbers.
async fn fetch(_cancel: CancellationToken) -> Result<String, String> {
    let num = rand::rng().random_range(1000..2000);
    tokio::time::sleep(tokio::time::Duration::from_millis(num)).await;

    if num % 2 == 0 {
        return Err(format!("BAD NUMBER: {num}"));
    }
    Ok("test".to_string())
}

/// Create our map and then loop around 5 times creating 100
/// jobs which all get the same key.
/// We print out data about each iteration where we see how many
/// succeed, the range of times between each completion and how
/// long the iteration took.
/// As long as the factory fails, all of the gets in an iteration
/// fail and the factory is invoked again in the next one. As soon
/// as one invocation succeeds, all remaining loops succeed since
/// they'll get the value from the map.
#[tokio::main]
async fn main() {
    let map: Arc<LazyMap<usize, String, String>> = Arc::new(LazyMap::new());
    let token = CancellationToken::new();

    for _i in 0..5 {
        let mut hdls = vec![];
        let start = Instant::now();
        for _i in 0..100 {
            let my_map = map.clone();
            let my_token = token.clone();
            hdls.push(async move {
                let result = my_map.get(5, fetch, &my_token).await;
                (Instant::now(), result)
            });
        }
        let mut result: Vec<(Instant, Result<Arc<String>, LazyMapError<String>>)> =
            futures::future::join_all(hdls).await.into_iter().collect();
        result.sort_by_key(|(instant, _)| *instant);
        println!(
            "range: {:?}",
            result.last().unwrap().0 - result.first().unwrap().0
        );
        println!(
            "passed: {:?}",
            result.iter().filter(|(_, outcome)| outcome.is_ok()).count()
        );
        if let Some((_, Err(error))) = result.first() {
            println!("error: {error}");
        }
        println!(
            "requests: {}, deduplicated: {}",
            map.request_count(),
            map.request_deduplicated_count()
        );
        println!("elapsed: {:?}\n", Instant::now() - start);
    }

    map.dispose_async().await;
}
