#![deny(dead_code)]
#![deny(unused_imports)]

pub mod basis;
pub mod crossval;
pub mod data;
pub mod diagnostics;
pub mod executor;
pub mod lasso;
pub mod model;
pub mod neighbors;
pub mod normalize;
pub mod polynomial;
pub mod solver;
