use serde::{Deserialize, Serialize};

/// Account embedded in a transaction
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
  pub id: String,
  pub name: String,
  pub account_type: String,
}

/// Account as listed by `/accounts`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountDetail {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub balance: String,
  #[serde(default)]
  pub currency: String,
  #[serde(default)]
  pub classification: String,
  #[serde(default)]
  pub account_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Category {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub classification: String,
  #[serde(default)]
  pub color: String,
  #[serde(default)]
  pub icon: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Tag {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub color: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Merchant {
  pub id: String,
  pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
  pub id: String,
  pub amount: String,
  pub currency: String,
  pub other_account: Option<Account>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
  pub id: String,
  pub date: String,
  pub amount: String,
  pub currency: String,
  pub name: String,
  #[serde(default)]
  pub notes: Option<String>,
  #[serde(default)]
  pub classification: String,
  pub account: Account,
  #[serde(default)]
  pub category: Option<Category>,
  #[serde(default)]
  pub merchant: Option<Merchant>,
  #[serde(default)]
  pub tags: Vec<Tag>,
  #[serde(default)]
  pub transfer: Option<Transfer>,
  #[serde(default)]
  pub created_at: String,
  #[serde(default)]
  pub updated_at: String,
}

/// Transaction direction as accepted by the create endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Nature {
  Income,
  Expense,
  Inflow,
  Outflow,
}

impl Nature {
  pub fn as_str(&self) -> &'static str {
    match self {
      Nature::Income => "income",
      Nature::Expense => "expense",
      Nature::Inflow => "inflow",
      Nature::Outflow => "outflow",
    }
  }
}

/// Payload of the `transactions.create` mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTransactionInput {
  pub account_id: String,
  pub date: String,
  pub amount: f64,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub nature: Option<Nature>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub category_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub merchant_id: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub notes: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub currency: Option<String>,
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub tag_ids: Vec<String>,
}
