mod cancellation;
mod failures;
mod recovery;
mod stages;
