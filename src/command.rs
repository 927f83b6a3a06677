use clap::Subcommand;

// Module declarations (alphabetical)
pub mod count;
pub mod threadcount;

pub use count::{Count, CountCMD};
pub use threadcount::determine_thread_counts_1;

///////////////////////////////
/// Possible subcommands to parse
#[derive(Subcommand)]
pub enum Commands {
    Count(CountCMD),
}
