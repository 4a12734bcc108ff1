pub use event::{EventGeometry, SyntheticEvent, poisson_counts, single_module_caches};

mod event;
