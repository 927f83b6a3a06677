pub mod command;
pub mod counting;
pub mod fileformat;
pub mod utils;

pub use counting::CountConfig;
pub use counting::UnitCatalog;
pub use fileformat::Region;
pub use fileformat::Snp;
