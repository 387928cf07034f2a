pub mod footer;
pub mod header;
pub mod utils;

pub use footer::{draw_footer, Flash};
pub use header::{draw_header, draw_setup_banner, HeaderInfo};
pub use utils::{classification_color, connectivity_style, truncate};
