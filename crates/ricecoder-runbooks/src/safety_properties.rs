//! Property-based tests for danger classification and overall risk

#[cfg(test)]
mod tests {
    use crate::models::*;
    use crate::safety::{DangerPolicy, SafetyAnalyzer};
    use proptest::prelude::*;

    const DANGEROUS: &[&str] = &["delete", "drop", "kill", "wipe", "Terminate", "PURGE"];
    const CRITICAL: &[&str] = &["production", "prod", "database", "cluster", "ALL"];
    const NEUTRAL: &[&str] = &["check", "restart", "deploy", "inspect", "rotate"];

    fn arb_word(words: &'static [&'static str]) -> impl Strategy<Value = String> {
        prop::sample::select(words).prop_map(|w| w.to_string())
    }

    // Builds step text out of optional dangerous and critical keywords
    fn arb_step() -> impl Strategy<Value = (RunbookStep, bool, bool)> {
        (
            prop::option::of(arb_word(DANGEROUS)),
            prop::option::of(arb_word(CRITICAL)),
            arb_word(NEUTRAL),
            any::<bool>(),
            any::<bool>(),
        )
            .prop_map(|(dangerous, critical, neutral, production, in_command)| {
                let mut words = vec![neutral];
                words.extend(dangerous.clone());
                words.extend(critical.clone());
                let text = words.join(" ");

                let mut step = RunbookStep::new("step", "Step");
                if in_command {
                    step.command = Some(text);
                } else {
                    step.name = text;
                }
                step.affects_production = production;
                (step, dangerous.is_some(), critical.is_some())
            })
    }

    proptest! {
        /// Only the combination of a dangerous keyword, a critical context and the
        /// production flag yields Critical.
        #[test]
        fn prop_critical_iff_all_signals((step, dangerous, critical) in arb_step()) {
            let level = DangerPolicy::default().classify(&step);
            let all = dangerous && critical && step.affects_production;
            prop_assert_eq!(level == DangerLevel::Critical, all);
        }

        /// Steps with neither a dangerous keyword nor the production flag are never flagged.
        #[test]
        fn prop_no_signal_no_danger((step, dangerous, _critical) in arb_step()) {
            prop_assume!(!dangerous && !step.affects_production);
            prop_assert_eq!(DangerPolicy::default().classify(&step), DangerLevel::None);
        }

        /// Automatic runs are allowed exactly when risk is low and nothing needs approval.
        #[test]
        fn prop_can_run_automatically_consistent(steps in prop::collection::vec(arb_step(), 0..8)) {
            let runbook = RunbookDefinition {
                id: "rb".to_string(),
                name: "Runbook".to_string(),
                description: String::new(),
                steps: steps
                    .into_iter()
                    .enumerate()
                    .map(|(i, (mut step, _, _))| {
                        step.id = format!("s{}", i);
                        step
                    })
                    .collect(),
            };

            let analysis = SafetyAnalyzer::new().analyze(&runbook);

            prop_assert_eq!(
                analysis.can_run_automatically,
                analysis.overall_risk == RiskLevel::Low && analysis.required_approvals.is_empty()
            );
            prop_assert_eq!(analysis.recommends_dry_run, !analysis.dangerous_steps.is_empty());

            let high_or_above = analysis
                .dangerous_steps
                .iter()
                .filter(|d| d.danger_level >= DangerLevel::High)
                .count();
            prop_assert_eq!(analysis.required_approvals.len(), high_or_above);
        }
    }
}
