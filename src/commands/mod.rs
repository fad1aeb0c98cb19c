pub mod decode_sbs1;
pub mod run;

pub use decode_sbs1::handle_decode_sbs1;
pub use run::handle_run;
