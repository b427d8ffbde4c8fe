//! The settings domains of the shop and their per-domain configuration.
//!
//! Domains differ only in data: where the document lives, whether saves
//! patch or replace it, and which flat form keys map to nested paths.

use crate::path::PathAliases;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How a domain submits changes to the settings API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// `PATCH` with only the changed fields.
    Patch,
    /// `PUT` with the complete document.
    Put,
}

/// A settings document kept by the shop front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SettingsDomain {
    /// Shop profile, tax and sale thresholds.
    Business,
    /// Which events notify staff, and how.
    Notifications,
    /// What consignors may see and do in their portal.
    ConsignorPermissions,
    /// Agreement and default terms for new consignors.
    ConsignorOnboarding,
    /// Public storefront visibility and appearance.
    Storefront,
    /// Tax rates and accounting periods.
    Accounting,
    /// Payout schedule and automation rules.
    Payouts,
}

impl SettingsDomain {
    /// Every domain, in display order.
    pub const ALL: [SettingsDomain; 7] = [
        SettingsDomain::Business,
        SettingsDomain::Notifications,
        SettingsDomain::ConsignorPermissions,
        SettingsDomain::ConsignorOnboarding,
        SettingsDomain::Storefront,
        SettingsDomain::Accounting,
        SettingsDomain::Payouts,
    ];

    /// Stable name used in logs and URLs.
    pub fn name(&self) -> &'static str {
        match self {
            SettingsDomain::Business => "business",
            SettingsDomain::Notifications => "notifications",
            SettingsDomain::ConsignorPermissions => "consignor-permissions",
            SettingsDomain::ConsignorOnboarding => "consignor-onboarding",
            SettingsDomain::Storefront => "storefront",
            SettingsDomain::Accounting => "accounting",
            SettingsDomain::Payouts => "payouts",
        }
    }

    /// Resource path of the domain's document on the settings API.
    pub fn resource(&self) -> &'static str {
        match self {
            SettingsDomain::Business => "/api/settings/business",
            SettingsDomain::Notifications => "/api/settings/notifications",
            SettingsDomain::ConsignorPermissions => "/api/settings/consignor-permissions",
            SettingsDomain::ConsignorOnboarding => "/api/settings/consignor-onboarding",
            SettingsDomain::Storefront => "/api/settings/storefront",
            SettingsDomain::Accounting => "/api/settings/accounting",
            SettingsDomain::Payouts => "/api/settings/payouts",
        }
    }

    /// Storefront and payout forms always submit the whole document.
    pub fn write_mode(&self) -> WriteMode {
        match self {
            SettingsDomain::Storefront | SettingsDomain::Payouts => WriteMode::Put,
            _ => WriteMode::Patch,
        }
    }

    /// Flat form keys that address nested fields.
    pub fn alias_pairs(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            SettingsDomain::Business => &[
                ("shopName", "profile.shopName"),
                ("salesTaxRate", "tax.salesTaxRate"),
                ("pricesIncludeTax", "tax.pricesIncludeTax"),
                ("highValueSale", "thresholds.highValueSale"),
            ],
            SettingsDomain::Notifications => &[
                ("emailOnSale", "channels.email.sale"),
                ("smsOnSale", "channels.sms.sale"),
                ("dailyDigest", "digest.daily"),
            ],
            SettingsDomain::ConsignorPermissions => &[
                ("canEditPrices", "items.editPrices"),
                ("canViewSales", "sales.view"),
                ("canRequestPayout", "payouts.request"),
            ],
            SettingsDomain::ConsignorOnboarding => &[
                ("requireAgreement", "agreement.required"),
                ("defaultSplit", "terms.defaultSplitPercent"),
            ],
            SettingsDomain::Storefront => &[
                ("storeVisible", "visibility.enabled"),
                ("theme", "appearance.theme"),
            ],
            SettingsDomain::Accounting => &[
                ("salesTaxRate", "tax.salesTaxRate"),
                ("fiscalYearStart", "periods.fiscalYearStart"),
            ],
            SettingsDomain::Payouts => &[
                ("autoPayout", "automation.enabled"),
                ("payoutDay", "automation.schedule.day"),
                ("minimumPayout", "automation.minimumAmount"),
            ],
        }
    }

    /// The alias table for this domain.
    pub fn aliases(&self) -> PathAliases {
        PathAliases::from_pairs(self.alias_pairs().iter().copied()).unwrap_or_default()
    }
}

impl fmt::Display for SettingsDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SettingsDomain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SettingsDomain::ALL
            .into_iter()
            .find(|domain| domain.name() == s)
            .ok_or_else(|| format!("unknown settings domain: {s}"))
    }
}
