mod split_pool;

pub use split_pool::{SplitThreadPool, Task, ThreadPoolError};
