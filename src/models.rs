use serde::{Deserialize, Serialize};

/// Price value written when none of the price locators matched.
pub const PRICE_UNRESOLVED: &str = "unresolved";

#[derive(Debug, Clone)]
pub struct CrawlTask {
    pub organization_name: String,
    pub listing_root_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductVariationRecord {
    pub product_name: String,
    pub variation_name: String,
    pub jan_code: String,
    pub model_number: String,
    pub wholesale_price: String,
    pub source_url: String,
}

impl ProductVariationRecord {
    pub const HEADERS: [&'static str; 6] = [
        "product_name",
        "variation_name",
        "jan_code",
        "model_number",
        "wholesale_price",
        "source_url",
    ];

    pub fn as_row(&self) -> [&str; 6] {
        [
            &self.product_name,
            &self.variation_name,
            &self.jan_code,
            &self.model_number,
            &self.wholesale_price,
            &self.source_url,
        ]
    }
}
