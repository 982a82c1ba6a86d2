// src/strategy.rs
/// Initial adaptive batch size handed to the planner
pub const INITIAL_BATCH_SIZE: usize = 50;
/// Lower bound for the adaptive batch size
pub const MIN_BATCH_SIZE: usize = 10;
/// Upper bound for the adaptive batch size
pub const MAX_BATCH_SIZE: usize = 200;
/// EMA learning rate for per-strategy success rate / similarity
pub const STRATEGY_LEARNING_RATE: f64 = 0.1;
/// Sliding window of recent mutation results kept for adaptation
pub const RESULT_WINDOW_SIZE: usize = 1000;
/// Recordings needed before the batch size starts adapting
pub const BATCH_ADAPT_MIN_TOTAL: u64 = 10;
/// High-similarity ratio above which the batch size grows
pub const BATCH_GROW_RATIO: f64 = 0.3;
/// High-similarity ratio below which the batch size shrinks
pub const BATCH_SHRINK_RATIO: f64 = 0.1;

// src/concurrency.rs
/// Maximum concurrently running mutation executions
pub const DEFAULT_OPERATION_PERMITS: usize = 10;
/// Workers kept alive by the worker pool
pub const DEFAULT_POOL_WORKERS: usize = 8;
/// Bound of the worker pool task / result channels
pub const POOL_CHANNEL_BOUND: usize = 256;

// src/cache.rs
/// TTL of the strategy result cache
pub const STRATEGY_CACHE_TTL_SECS: u64 = 300;

// src/replay.rs
/// Total mutations generated per replay in call-based mode
pub const DEFAULT_TOTAL_MUTATIONS: usize = 50;
/// Similarity above which a mutant counts as a successful variant
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.7;
/// Pause between raw-transaction sends, avoids nonce races
pub const SEND_PAUSE_MS: u64 = 1000;

// src/errors.rs
/// Retry attempts for recoverable network/api/timeout errors
pub const MAX_RETRIES: u32 = 3;
/// Base delay of the exponential backoff
pub const RETRY_BASE_DELAY_MS: u64 = 200;
/// Backoff cap
pub const RETRY_MAX_DELAY_MS: u64 = 5000;

// src/evm/host.rs
/// Gas handed to every interpreter; gas metering is disabled
pub const EVM_CALL_GAS: u64 = 1e10 as u64;

// src/mutation/step.rs
/// Maximum storage slots touched by a single step-based candidate
pub const DEFAULT_MAX_SLOT_CHANGES: usize = 3;

// src/analyzer.rs
/// Slots numbered below this are treated as declared simple variables
pub const SIMPLE_SLOT_BOUND: u64 = 10;
/// Slots numbered above this are treated as array elements
pub const ARRAY_SLOT_BOUND: u64 = 1000;
