pub mod local_store;
pub mod node_aggregator;
pub mod object_store;
pub mod region_builder;
pub mod summarizer;
pub mod summary_store;
pub mod tombstone;

#[cfg(test)]
pub mod test_support;
