use carwatch_core::{fold_eq, is_wildcard_trim, ListingSnapshot, NotificationRule, TriggeredNotification};
use tracing::warn;

/// Screens changed listings against notification rules.
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationEvaluator;

impl NotificationEvaluator {
    /// One notification per rule of the listing's model whose predicates all hold.
    pub fn evaluate(
        &self,
        listing: &ListingSnapshot,
        rules: &[NotificationRule],
    ) -> Vec<TriggeredNotification> {
        rules
            .iter()
            .filter(|rule| rule.applies_to_model(listing.model()))
            .filter(|rule| self.rule_fires(rule, listing))
            .map(|rule| TriggeredNotification {
                listing: listing.clone(),
                email: rule.email.clone(),
            })
            .collect()
    }

    pub fn rule_fires(&self, rule: &NotificationRule, listing: &ListingSnapshot) -> bool {
        let under_threshold = rule
            .price_threshold
            .map_or(true, |threshold| listing.price < threshold);
        let recent_enough = parse_bound(rule.earliest_year.as_deref())
            .map_or(true, |year| i64::from(listing.year) >= year);
        let mileage_ok = parse_bound(rule.max_km_driven.as_deref())
            .map_or(true, |km| listing.km_driven <= km);
        let trim_ok = is_wildcard_trim(&rule.trim) || fold_eq(rule.trim.trim(), listing.trim.trim());

        under_threshold && recent_enough && mileage_ok && trim_ok
    }

    /// Logs rules whose numeric bounds will be ignored. Called once per run.
    pub fn lint_rules(&self, rules: &[NotificationRule]) -> usize {
        let mut ignored = 0;
        for rule in rules {
            for (field, raw) in [
                ("earliest_year", rule.earliest_year.as_deref()),
                ("max_km_driven", rule.max_km_driven.as_deref()),
            ] {
                if let Some(raw) = raw {
                    if !raw.trim().is_empty() && parse_bound(Some(raw)).is_none() {
                        warn!(model = %rule.model, email = %rule.email, field, raw, "non-numeric rule bound ignored");
                        ignored += 1;
                    }
                }
            }
        }
        ignored
    }
}

/// Blank or non-numeric bounds count as unset.
fn parse_bound(raw: Option<&str>) -> Option<i64> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| value.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use carwatch_core::{ScrapedListing, WILDCARD_TRIM};
    use chrono::{TimeZone, Utc};

    fn listing(price: i64) -> ListingSnapshot {
        ListingSnapshot::first_observation(
            &ScrapedListing {
                id: "1".into(),
                model: "Golf".into(),
                trim: "GTI".into(),
                href: "/brugt/bil/1".into(),
                km_driven: 80_000,
                year: 2018,
                price,
                description: None,
                region: None,
            },
            Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap(),
        )
    }

    fn rule() -> NotificationRule {
        NotificationRule {
            model: "Golf".into(),
            trim: WILDCARD_TRIM.into(),
            price_threshold: None,
            earliest_year: None,
            max_km_driven: None,
            email: "a@b.com".into(),
        }
    }

    #[test]
    fn unconstrained_wildcard_rule_fires_for_every_listing() {
        let fired = NotificationEvaluator.evaluate(&listing(1_000_000), &[rule()]);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].email, "a@b.com");
    }

    #[test]
    fn price_threshold_is_strict() {
        let rule = NotificationRule {
            price_threshold: Some(20_000),
            ..rule()
        };
        assert!(NotificationEvaluator.evaluate(&listing(20_000), &[rule.clone()]).is_empty());
        assert_eq!(NotificationEvaluator.evaluate(&listing(19_999), &[rule]).len(), 1);
    }

    #[test]
    fn threshold_scenario_matches_expected_notifications() {
        let rule = NotificationRule {
            price_threshold: Some(95_000),
            ..rule()
        };
        let fired = NotificationEvaluator.evaluate(&listing(90_000), &[rule.clone()]);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].email, "a@b.com");
        assert_eq!(fired[0].listing.price, 90_000);
        assert!(NotificationEvaluator.evaluate(&listing(96_000), &[rule]).is_empty());
    }

    #[test]
    fn year_and_mileage_bounds_are_inclusive() {
        let rule = NotificationRule {
            earliest_year: Some("2018".into()),
            max_km_driven: Some("80000".into()),
            ..rule()
        };
        assert!(NotificationEvaluator.rule_fires(&rule, &listing(100_000)));

        let stricter = NotificationRule {
            earliest_year: Some("2019".into()),
            ..rule.clone()
        };
        assert!(!NotificationEvaluator.rule_fires(&stricter, &listing(100_000)));

        let lower_km = NotificationRule {
            max_km_driven: Some("79999".into()),
            ..rule
        };
        assert!(!NotificationEvaluator.rule_fires(&lower_km, &listing(100_000)));
    }

    #[test]
    fn blank_or_non_numeric_bounds_are_ignored() {
        let rule = NotificationRule {
            earliest_year: Some("  ".into()),
            max_km_driven: Some("lav".into()),
            ..rule()
        };
        assert!(NotificationEvaluator.rule_fires(&rule, &listing(100_000)));
        assert_eq!(NotificationEvaluator.lint_rules(&[rule]), 1);
    }

    #[test]
    fn trim_matches_case_insensitively_or_by_wildcard() {
        let exact = NotificationRule {
            trim: "gti".into(),
            ..rule()
        };
        let other = NotificationRule {
            trim: "GTD".into(),
            ..rule()
        };
        let wildcard = NotificationRule {
            trim: "ANY".into(),
            ..rule()
        };
        assert!(NotificationEvaluator.rule_fires(&exact, &listing(1)));
        assert!(!NotificationEvaluator.rule_fires(&other, &listing(1)));
        assert!(NotificationEvaluator.rule_fires(&wildcard, &listing(1)));
    }

    #[test]
    fn rules_for_other_models_never_fire() {
        let polo = NotificationRule {
            model: "Polo".into(),
            ..rule()
        };
        let fired = NotificationEvaluator.evaluate(&listing(1), &[polo, rule()]);
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn one_listing_can_fire_many_rules() {
        let second = NotificationRule {
            email: "c@d.com".into(),
            ..rule()
        };
        let fired = NotificationEvaluator.evaluate(&listing(1), &[rule(), second]);
        let emails: Vec<&str> = fired.iter().map(|n| n.email.as_str()).collect();
        assert_eq!(emails, vec!["a@b.com", "c@d.com"]);
    }
}
