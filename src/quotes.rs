//! Service package catalog and quote rendering.
//!
//! The packages are a fixed catalog; the decision engine picks a tier (or the
//! orchestrator falls back on deal value) and the rendered quote becomes both
//! the outbound message body and the contract line item.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Catalog tier. `Growth` is the default pitch when nothing else is known.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageTier {
    Starter,
    #[default]
    Growth,
    Premium,
}

impl PackageTier {
    pub fn all() -> [PackageTier; 3] {
        [Self::Starter, Self::Growth, Self::Premium]
    }

    /// The catalog entry for this tier.
    pub fn package(self) -> ServicePackage {
        match self {
            Self::Starter => ServicePackage {
                tier: self,
                name: "Starter Growth Package",
                monthly_price: dec!(15000),
                deliverables: &[
                    "Basic SEO setup",
                    "5-page website redesign",
                    "Google My Business setup",
                ],
                best_for: "Small e-commerce with no online presence",
            },
            Self::Growth => ServicePackage {
                tier: self,
                name: "E-Commerce Growth Package",
                monthly_price: dec!(35000),
                deliverables: &[
                    "Full SEO strategy",
                    "Shopify/WooCommerce optimization",
                    "Google Ads (₹10k ad budget mgmt)",
                    "Monthly reporting",
                ],
                best_for: "Stores with site but low traffic",
            },
            Self::Premium => ServicePackage {
                tier: self,
                name: "Premium Scale Package",
                monthly_price: dec!(75000),
                deliverables: &[
                    "Full website rebuild",
                    "Advanced SEO",
                    "Google + Meta Ads",
                    "Conversion rate optimization",
                    "Dedicated account manager",
                ],
                best_for: "Growing stores wanting aggressive scale",
            },
        }
    }

    /// Best tier for a known deal value: the highest tier whose monthly price
    /// fits. `None` when no deal value has been estimated yet.
    pub fn for_deal_value(value: Decimal) -> Option<PackageTier> {
        if value <= Decimal::ZERO {
            return None;
        }
        let tier = Self::all()
            .into_iter()
            .rev()
            .find(|t| t.package().monthly_price <= value)
            .unwrap_or(Self::Starter);
        Some(tier)
    }
}

impl std::fmt::Display for PackageTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starter => write!(f, "starter"),
            Self::Growth => write!(f, "growth"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

impl std::str::FromStr for PackageTier {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starter" => Ok(Self::Starter),
            "growth" => Ok(Self::Growth),
            "premium" => Ok(Self::Premium),
            _ => Err(format!("Unknown package tier: {s}")),
        }
    }
}

/// One entry in the service catalog.
#[derive(Debug, Clone, Serialize)]
pub struct ServicePackage {
    pub tier: PackageTier,
    pub name: &'static str,
    pub monthly_price: Decimal,
    pub deliverables: &'static [&'static str],
    pub best_for: &'static str,
}

/// Render a quote as the plain-text body sent to the lead.
pub fn render_quote(lead_name: &str, package: &ServicePackage, valid_until: DateTime<Utc>) -> String {
    let mut body = format!(
        "Hi {lead_name},\n\nHere is the quote we discussed: {} at ₹{}/month.\n\nWhat's included:\n",
        package.name, package.monthly_price,
    );
    for item in package.deliverables {
        body.push_str(&format!("  - {item}\n"));
    }
    body.push_str(&format!(
        "\nThis quote is valid until {}. Reply here and we can get started right away.\n",
        valid_until.format("%d %b %Y"),
    ));
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_string_roundtrips() {
        for t in PackageTier::all() {
            let parsed: PackageTier = t.to_string().parse().unwrap();
            assert_eq!(parsed, t);
        }
    }

    #[test]
    fn deal_value_picks_highest_affordable_tier() {
        assert_eq!(PackageTier::for_deal_value(dec!(0)), None);
        assert_eq!(PackageTier::for_deal_value(dec!(10000)), Some(PackageTier::Starter));
        assert_eq!(PackageTier::for_deal_value(dec!(15000)), Some(PackageTier::Starter));
        assert_eq!(PackageTier::for_deal_value(dec!(40000)), Some(PackageTier::Growth));
        assert_eq!(PackageTier::for_deal_value(dec!(90000)), Some(PackageTier::Premium));
    }

    #[test]
    fn rendered_quote_names_package_and_validity() {
        let pkg = PackageTier::Growth.package();
        let until = "2026-09-01T00:00:00Z".parse().unwrap();
        let body = render_quote("Asha", &pkg, until);
        assert!(body.contains("E-Commerce Growth Package"));
        assert!(body.contains("₹35000/month"));
        assert!(body.contains("01 Sep 2026"));
        assert!(body.contains("Monthly reporting"));
    }
}
