//! LiqLead Core: blind index construction and directional validation.
//!
//! This crate holds everything a single evaluation needs:
//! - Period-keyed series and the standardized variable matrix
//! - Four index builders behind one contract (PCA, ICA, sparse PCA, DFM)
//! - Directional metrics and the composite waveform score with lag search
//! - Granger causality, ADF stationarity and spectral coherence
//! - Deterministic RNG hierarchy and seeded synthetic panels

pub mod builders;
pub mod causality;
pub mod coherence;
pub mod composite;
pub mod matrix;
pub mod metrics;
pub mod rng;
pub mod series;
pub mod stats;
pub mod synthetic;

pub use builders::{
    BuildDiagnostics, BuildError, BuildOutput, Builder, BuilderKind, BuilderParams, IndexBuilder,
};
pub use composite::{CompositeScorer, LagMetrics, LagProfile, OptimalLag, WaveformWeights};
pub use matrix::VariableMatrix;
pub use series::{Cadence, TimeSeries};

#[cfg(test)]
mod tests {
    use super::*;

    /// Compile-time check: everything handed to resampling workers is Send + Sync.
    #[allow(dead_code)]
    fn assert_send_sync() {
        fn require_send<T: Send>() {}
        fn require_sync<T: Sync>() {}

        require_send::<series::TimeSeries>();
        require_sync::<series::TimeSeries>();
        require_send::<matrix::VariableMatrix>();
        require_sync::<matrix::VariableMatrix>();

        require_send::<builders::Builder>();
        require_sync::<builders::Builder>();
        require_send::<builders::BuilderParams>();
        require_sync::<builders::BuilderParams>();
        require_send::<builders::BuildOutput>();
        require_sync::<builders::BuildOutput>();
        require_send::<builders::BuildError>();
        require_sync::<builders::BuildError>();

        require_send::<composite::CompositeScorer>();
        require_sync::<composite::CompositeScorer>();
        require_send::<composite::LagProfile>();
        require_sync::<composite::LagProfile>();
        require_send::<causality::CausalityResult>();
        require_sync::<causality::CausalityResult>();
        require_send::<coherence::Availability<coherence::CoherenceSummary>>();
        require_sync::<coherence::Availability<coherence::CoherenceSummary>>();

        require_send::<rng::RngHierarchy>();
        require_sync::<rng::RngHierarchy>();
    }

    /// Architecture contract: builders never receive the target.
    ///
    /// `build` takes only a `VariableMatrix`. If a target parameter is ever
    /// added, this stops compiling.
    #[test]
    fn builder_trait_has_no_target_parameter() {
        fn _check(builder: &mut dyn IndexBuilder, matrix: &VariableMatrix) -> Result<BuildOutput, BuildError> {
            builder.build(matrix)
        }
    }

    #[test]
    fn target_named_columns_never_reach_the_numbers() {
        let panel = synthetic::LeadLagScenario::default().generate().unwrap();
        let mut series: Vec<(String, TimeSeries)> = panel
            .matrix
            .columns()
            .iter()
            .filter_map(|c| panel.matrix.column(c).map(|s| (c.clone(), s)))
            .collect();
        series.push(("Bitcoin_log".into(), panel.target.clone()));
        let polluted = VariableMatrix::from_series(series).unwrap();
        for kind in BuilderKind::ALL {
            let err = Builder::new(kind, &BuilderParams::default())
                .build(&polluted)
                .unwrap_err();
            assert!(matches!(err, BuildError::StructuralViolation { .. }), "{kind}");
        }
    }

    #[test]
    fn build_output_serializes_to_a_nested_mapping() {
        let panel = synthetic::LeadLagScenario::default().generate().unwrap();
        let out = Builder::new(BuilderKind::Pca, &BuilderParams::default())
            .build(&panel.matrix)
            .unwrap();
        let json = serde_json::to_value(&out).unwrap();
        assert_eq!(json["kind"], "pca");
        assert_eq!(json["diagnostics"]["kind"], "pca");
        assert!(json["loadings"]["net_liquidity"].is_number());
    }
}
