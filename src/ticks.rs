/// The number of retired conditional branches a task has executed. This is
/// the unit of "time" used to key asynchronous events to exact points in
/// the instruction stream; see `PerfCounters`.
pub type Ticks = u64;
