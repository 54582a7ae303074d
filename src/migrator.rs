use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240601_000001_create_leads_table::Migration),
            Box::new(m20240601_000002_create_promo_codes_table::Migration),
            Box::new(m20240601_000003_create_purchase_tables::Migration),
            Box::new(m20240601_000004_create_payment_transactions_table::Migration),
        ]
    }
}

// Migration implementations

mod m20240601_000001_create_leads_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000001_create_leads_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Leads::Table)
                        .if_not_exists()
                        .col(ColumnDef::new(Leads::Id).uuid().not_null().primary_key())
                        .col(ColumnDef::new(Leads::Email).string().not_null())
                        .col(ColumnDef::new(Leads::FullName).string().not_null())
                        .col(ColumnDef::new(Leads::Phone).string().not_null())
                        .col(ColumnDef::new(Leads::Country).string().not_null())
                        .col(ColumnDef::new(Leads::Status).string_len(32).not_null())
                        .col(ColumnDef::new(Leads::Metadata).json().null())
                        .col(
                            ColumnDef::new(Leads::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Leads::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            // Upserts target this index
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_leads_email")
                        .table(Leads::Table)
                        .col(Leads::Email)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Leads::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Leads {
        Table,
        Id,
        Email,
        FullName,
        Phone,
        Country,
        Status,
        Metadata,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000002_create_promo_codes_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000002_create_promo_codes_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PromoCodes::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PromoCodes::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(PromoCodes::Code).string_len(64).not_null())
                        .col(ColumnDef::new(PromoCodes::Description).string().null())
                        .col(
                            ColumnDef::new(PromoCodes::DiscountType)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PromoCodes::DiscountValue)
                                .decimal_len(12, 2)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PromoCodes::MinimumAmount)
                                .decimal_len(12, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(PromoCodes::MaximumDiscount)
                                .decimal_len(12, 2)
                                .null(),
                        )
                        .col(ColumnDef::new(PromoCodes::UsageLimit).integer().null())
                        .col(
                            ColumnDef::new(PromoCodes::UsedCount)
                                .integer()
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(PromoCodes::ValidFrom)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PromoCodes::ValidUntil)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PromoCodes::ApplicableTicketTypes)
                                .json()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PromoCodes::ApplicableEventId)
                                .string()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PromoCodes::IsActive)
                                .boolean()
                                .not_null()
                                .default(true),
                        )
                        .col(
                            ColumnDef::new(PromoCodes::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PromoCodes::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_promo_codes_code")
                        .table(PromoCodes::Table)
                        .col(PromoCodes::Code)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PromoCodes::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum PromoCodes {
        Table,
        Id,
        Code,
        Description,
        DiscountType,
        DiscountValue,
        MinimumAmount,
        MaximumDiscount,
        UsageLimit,
        UsedCount,
        ValidFrom,
        ValidUntil,
        ApplicableTicketTypes,
        ApplicableEventId,
        IsActive,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240601_000003_create_purchase_tables {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000003_create_purchase_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Purchasers::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Purchasers::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Purchasers::FullName).string().not_null())
                        .col(ColumnDef::new(Purchasers::Email).string().not_null())
                        .col(ColumnDef::new(Purchasers::Phone).string().not_null())
                        .col(ColumnDef::new(Purchasers::Organization).string().null())
                        .col(ColumnDef::new(Purchasers::Country).string().not_null())
                        .col(
                            ColumnDef::new(Purchasers::IsAttending)
                                .boolean()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Purchasers::TermsAccepted)
                                .boolean()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Purchasers::UpdatesConsent)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Purchasers::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Purchases::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Purchases::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Purchases::PurchaserId).uuid().not_null())
                        .col(
                            ColumnDef::new(Purchases::Subtotal)
                                .decimal_len(12, 2)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Purchases::DiscountAmount)
                                .decimal_len(12, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Purchases::TaxAmount)
                                .decimal_len(12, 2)
                                .not_null()
                                .default(0),
                        )
                        .col(
                            ColumnDef::new(Purchases::FinalAmount)
                                .decimal_len(12, 2)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Purchases::Currency).string_len(3).not_null())
                        .col(
                            ColumnDef::new(Purchases::PaymentMethod)
                                .string_len(32)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Purchases::InvoiceReference).string().null())
                        .col(ColumnDef::new(Purchases::Status).string_len(16).not_null())
                        .col(
                            ColumnDef::new(Purchases::PaymentStatus)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(ColumnDef::new(Purchases::PromoCodeId).uuid().null())
                        .col(ColumnDef::new(Purchases::PromoCode).string_len(64).null())
                        .col(ColumnDef::new(Purchases::PaymentReference).string().null())
                        .col(
                            ColumnDef::new(Purchases::PaidAt)
                                .timestamp_with_time_zone()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(Purchases::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(Purchases::UpdatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_purchases_purchaser")
                                .from(Purchases::Table, Purchases::PurchaserId)
                                .to(Purchasers::Table, Purchasers::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_purchases_payment_reference")
                        .table(Purchases::Table)
                        .col(Purchases::PaymentReference)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_purchases_status")
                        .table(Purchases::Table)
                        .col(Purchases::Status)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(PurchaseItems::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PurchaseItems::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(PurchaseItems::PurchaseId).uuid().not_null())
                        .col(ColumnDef::new(PurchaseItems::TicketName).string().not_null())
                        .col(ColumnDef::new(PurchaseItems::Quantity).integer().not_null())
                        .col(
                            ColumnDef::new(PurchaseItems::UnitPrice)
                                .decimal_len(12, 2)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PurchaseItems::LineTotal)
                                .decimal_len(12, 2)
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_purchase_items_purchase")
                                .from(PurchaseItems::Table, PurchaseItems::PurchaseId)
                                .to(Purchases::Table, Purchases::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Attendees::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(Attendees::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(ColumnDef::new(Attendees::PurchaseId).uuid().not_null())
                        .col(ColumnDef::new(Attendees::PurchaserId).uuid().not_null())
                        .col(ColumnDef::new(Attendees::TicketType).string().not_null())
                        .col(ColumnDef::new(Attendees::FullName).string().not_null())
                        .col(ColumnDef::new(Attendees::Email).string().not_null())
                        .col(ColumnDef::new(Attendees::Role).string().not_null())
                        .col(ColumnDef::new(Attendees::Organization).string().not_null())
                        .col(
                            ColumnDef::new(Attendees::IsPrimary)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(
                            ColumnDef::new(Attendees::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_attendees_purchase")
                                .from(Attendees::Table, Attendees::PurchaseId)
                                .to(Purchases::Table, Purchases::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_attendees_purchaser")
                                .from(Attendees::Table, Attendees::PurchaserId)
                                .to(Purchasers::Table, Purchasers::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_attendees_purchase_id")
                        .table(Attendees::Table)
                        .col(Attendees::PurchaseId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Attendees::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(PurchaseItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Purchases::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Purchasers::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Purchasers {
        Table,
        Id,
        FullName,
        Email,
        Phone,
        Organization,
        Country,
        IsAttending,
        TermsAccepted,
        UpdatesConsent,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum Purchases {
        Table,
        Id,
        PurchaserId,
        Subtotal,
        DiscountAmount,
        TaxAmount,
        FinalAmount,
        Currency,
        PaymentMethod,
        InvoiceReference,
        Status,
        PaymentStatus,
        PromoCodeId,
        PromoCode,
        PaymentReference,
        PaidAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum PurchaseItems {
        Table,
        Id,
        PurchaseId,
        TicketName,
        Quantity,
        UnitPrice,
        LineTotal,
    }

    #[derive(DeriveIden)]
    enum Attendees {
        Table,
        Id,
        PurchaseId,
        PurchaserId,
        TicketType,
        FullName,
        Email,
        Role,
        Organization,
        IsPrimary,
        CreatedAt,
    }
}

mod m20240601_000004_create_payment_transactions_table {

    use sea_orm_migration::prelude::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240601_000004_create_payment_transactions_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(PaymentTransactions::Table)
                        .if_not_exists()
                        .col(
                            ColumnDef::new(PaymentTransactions::Id)
                                .uuid()
                                .not_null()
                                .primary_key(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::PurchaseId)
                                .uuid()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::GatewayReference)
                                .string()
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::Amount)
                                .decimal_len(14, 2)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::Currency)
                                .string_len(3)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::CanonicalAmount)
                                .decimal_len(12, 2)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::Status)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::GatewayResponse)
                                .json()
                                .null(),
                        )
                        .col(
                            ColumnDef::new(PaymentTransactions::CreatedAt)
                                .timestamp_with_time_zone()
                                .not_null(),
                        )
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_payment_transactions_purchase")
                                .from(PaymentTransactions::Table, PaymentTransactions::PurchaseId)
                                .to(Purchases::Table, Purchases::Id),
                        )
                        .to_owned(),
                )
                .await?;

            // Insert-or-ignore on verification retries relies on this index
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name("idx_payment_transactions_gateway_reference")
                        .table(PaymentTransactions::Table)
                        .col(PaymentTransactions::GatewayReference)
                        .unique()
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(PaymentTransactions::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum PaymentTransactions {
        Table,
        Id,
        PurchaseId,
        GatewayReference,
        Amount,
        Currency,
        CanonicalAmount,
        Status,
        GatewayResponse,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum Purchases {
        Table,
        Id,
    }
}
