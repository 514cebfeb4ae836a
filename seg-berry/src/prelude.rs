//! 🍇欢迎光临🍓
//!
//! 涵盖了本 crate 一系列常用的功能.

pub use crate::{Idx3d, Point3};

pub use crate::{check_geometry, ChannelImage, ProbabilityVolumes};
pub use crate::{ConfigError, NumericalError, SegError, SegResult};

pub use crate::mesh::AtlasMesh;

pub use crate::classes::ClassMapping;

pub use crate::mixture::{GaussianParameters, MixtureParameters};

pub use crate::bias::BiasFieldModel;

pub use crate::partial_volume::{SubvoxelGrid, SuperResolution};

pub use crate::{EmSegmenter, Initialization, SegmentReport, SegmenterConfig, SegmenterState};
