use crate::{
    CentreCorrectionParams, CornerSearchParams, FilterParams, RefinementParams, VerifyParams,
};
use patch_calib_core::{ConfigError, MserDetector, PatternSize};
use serde::{Deserialize, Serialize};

/// Everything the per-frame pipeline needs, except the image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FinderParams {
    /// Expected patch grid.
    pub size: PatternSize,
    /// Stable-region detector and its [`patch_calib_core::PatchParams`].
    #[serde(default)]
    pub detector: MserDetector,
    #[serde(default)]
    pub filters: FilterParams,
    #[serde(default)]
    pub centres: CentreCorrectionParams,
    #[serde(default)]
    pub refinement: RefinementParams,
    #[serde(default)]
    pub corners: CornerSearchParams,
    #[serde(default)]
    pub verify: VerifyParams,
}

impl FinderParams {
    pub fn new(size: PatternSize) -> Self {
        Self {
            size,
            detector: MserDetector::default(),
            filters: FilterParams::default(),
            centres: CentreCorrectionParams::default(),
            refinement: RefinementParams::default(),
            corners: CornerSearchParams::default(),
            verify: VerifyParams::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.size.validate()?;
        self.detector.validate()?;
        self.filters.validate()?;
        self.centres.validate()?;
        self.refinement.validate()?;
        self.corners.validate()?;
        self.verify.validate()
    }
}
