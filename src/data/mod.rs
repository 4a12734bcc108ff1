mod observation;
pub use observation::{ModuleKey, ObservationCache};

mod data_vector;
pub use data_vector::{DataVectors, build_data_vectors};
