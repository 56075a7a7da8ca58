//! End-to-end pipeline scenarios on seeded synthetic panels.

use liqlead_core::builders::{BuildDiagnostics, BuilderKind};
use liqlead_core::coherence::Availability;
use liqlead_core::synthetic::LeadLagScenario;
use liqlead_runner::{
    BootstrapConfig, LoadingStability, Pipeline, PipelineConfig, PipelineInputs, PipelineState,
};

fn quick_config(builder: BuilderKind) -> PipelineConfig {
    PipelineConfig {
        builder,
        bootstrap: BootstrapConfig {
            n_resamples: 40,
            ..BootstrapConfig::default()
        },
        ..PipelineConfig::default()
    }
}

fn inputs(scenario: LeadLagScenario) -> PipelineInputs {
    let panel = scenario.generate().expect("synthetic panel");
    PipelineInputs {
        matrix: panel.matrix,
        target: panel.target,
        daily_matrix: None,
    }
}

// ── A. Known three-period lead ───────────────────────────────────────

#[test]
fn scenario_a_recovers_three_period_lead() {
    let result = Pipeline::new(quick_config(BuilderKind::Pca))
        .run(inputs(LeadLagScenario::default()))
        .unwrap();

    let stage2 = &result.stage2;
    assert_eq!(stage2.optimal.optimal_lag, 3);
    let mda = stage2.optimal.profile.at(3).and_then(|r| r.mda).unwrap();
    assert!(mda >= 0.95, "mda at lag 3 = {mda}");
    assert!(stage2.mda_significance.as_ref().is_some_and(|s| s.significant));
    assert!(result.stage1.sign.anchor_correlation.unwrap() > 0.99);
    assert_eq!(result.transitions.last(), Some(&PipelineState::Complete));
}

#[test]
fn scenario_a_is_reproducible() {
    let run = || {
        Pipeline::new(quick_config(BuilderKind::Pca))
            .run(inputs(LeadLagScenario {
                companion_noise: 0.2,
                ..LeadLagScenario::default()
            }))
            .unwrap()
    };
    let (a, b) = (run(), run());
    assert_eq!(a.stage3.loading_stability, b.stage3.loading_stability);
    assert_eq!(a.stage3.lag_stability, b.stage3.lag_stability);
    assert_eq!(a.config_fingerprint, b.config_fingerprint);
}

// ── B. Constant column ───────────────────────────────────────────────

#[test]
fn scenario_b_constant_column_gets_zero_loading() {
    let result = Pipeline::new(quick_config(BuilderKind::Pca))
        .run(inputs(LeadLagScenario {
            constant_column: true,
            companion_noise: 0.2,
            ..LeadLagScenario::default()
        }))
        .unwrap();

    let build = &result.stage1.build;
    assert_eq!(build.loadings.get("policy_rate_flat").copied().unwrap_or(0.0), 0.0);
    match &build.diagnostics {
        BuildDiagnostics::Pca { excluded_constant, .. } => {
            assert_eq!(excluded_constant, &vec!["policy_rate_flat".to_string()]);
        }
        other => panic!("unexpected diagnostics {other:?}"),
    }
    assert!(build.index.values().iter().all(|v| v.is_finite()));
}

// ── C. Too little data for CPCV ──────────────────────────────────────

#[test]
fn scenario_c_short_panel_reports_cpcv_insufficiency() {
    let result = Pipeline::new(quick_config(BuilderKind::Pca))
        .run(inputs(LeadLagScenario {
            n_periods: 50,
            companion_noise: 0.2,
            ..LeadLagScenario::default()
        }))
        .unwrap();

    match &result.stage3.cpcv {
        Availability::Unavailable { reason } => assert!(reason.contains("insufficient"), "{reason}"),
        Availability::Available(_) => panic!("cpcv ran on 50 observations"),
    }
    assert!(!result.acceptance.cpcv_mean.passed);
    assert_eq!(result.acceptance.cpcv_mean.actual, None);
    assert!(!result.acceptance.overall);
    assert_eq!(result.transitions.last(), Some(&PipelineState::Complete));
}

// ── Fallback and comparison ──────────────────────────────────────────

#[test]
fn ica_failure_on_tiny_panel_falls_back_then_fails_with_pca() {
    // Both builders need five rows; the default failing is fatal.
    let err = Pipeline::new(quick_config(BuilderKind::Ica))
        .run(inputs(LeadLagScenario {
            n_periods: 3,
            lead: 1,
            ..LeadLagScenario::default()
        }))
        .unwrap_err();
    assert!(err.to_string().contains("pca"), "{err}");
}

#[test]
fn healthy_run_passes_the_acceptance_table() {
    let result = Pipeline::new(quick_config(BuilderKind::Pca))
        .run(inputs(LeadLagScenario {
            companion_noise: 0.2,
            ..LeadLagScenario::default()
        }))
        .unwrap();

    let acceptance = &result.acceptance;
    assert!(acceptance.min_mda.passed, "{acceptance:?}");
    assert!(acceptance.bootstrap_anchor_ci_excludes_zero.passed);
    assert!(acceptance.cpcv_mean.passed);
    assert!(matches!(result.stage3.loading_stability, LoadingStability::Stable(_)));
}

#[test]
fn comparison_includes_dfm_when_daily_inputs_are_supplied() {
    let panel = LeadLagScenario {
        companion_noise: 0.3,
        ..LeadLagScenario::default()
    }
    .generate()
    .unwrap();
    let inputs = PipelineInputs {
        daily_matrix: Some(panel.matrix.clone()),
        matrix: panel.matrix,
        target: panel.target,
    };
    let comparison = Pipeline::new(quick_config(BuilderKind::Pca))
        .compare_all_methods(&inputs)
        .unwrap();
    assert_eq!(comparison.n_methods_tried, 4);
    assert_eq!(comparison.rankings.len() + comparison.failures.len(), 4);
    assert!(comparison.deflation.deflated_score <= comparison.deflation.best_score);
    assert!(comparison.rankings.windows(2).all(|w| w[0].best_cws >= w[1].best_cws));
}
