//! Fixed lookup tables: order types, order/vehicle status codes.
//!
//! The order-type catalog is the routing backbone: an order's
//! `order_type_code` indexes one entry here, and a vehicle's
//! `supported_types` is a comma-joined subset of these codes.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// OrderStatus
// ---------------------------------------------------------------------------

/// Lifecycle states of an order row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum OrderStatus {
    Pending = 0,
    Claimed = 1,
    Delivering = 2,
    Completed = 3,
    Canceled = 4,
}

impl OrderStatus {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Pending),
            1 => Some(Self::Claimed),
            2 => Some(Self::Delivering),
            3 => Some(Self::Completed),
            4 => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    /// Operator-facing label, matching the upstream merchant console.
    pub fn label(self) -> &'static str {
        match self {
            Self::Pending => "待处理",
            Self::Claimed => "已接单",
            Self::Delivering => "配送中",
            Self::Completed => "已完成",
            Self::Canceled => "已取消",
        }
    }
}

// ---------------------------------------------------------------------------
// VehicleModel / VehicleStatus
// ---------------------------------------------------------------------------

/// Vehicle hardware class.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum VehicleModel {
    /// Four-wheel ground vehicle.
    Ground = 1,
    Drone = 2,
    Robot = 3,
}

impl VehicleModel {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            1 => Some(Self::Ground),
            2 => Some(Self::Drone),
            3 => Some(Self::Robot),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Ground => "四轮车",
            Self::Drone => "无人机",
            Self::Robot => "机器人",
        }
    }
}

/// Operational state of a vehicle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum VehicleStatus {
    Idle = 0,
    Busy = 1,
    Maintenance = 2,
}

impl VehicleStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

// ---------------------------------------------------------------------------
// Order-type catalog
// ---------------------------------------------------------------------------

/// One entry of the order-type catalog.
#[derive(Clone, Copy, Debug)]
pub struct OrderTypeInfo {
    /// Numeric routing key carried in message headers.
    pub code: i64,
    /// Vehicle class that serves this order type.
    pub model: VehicleModel,
    /// Goods category.
    pub category: &'static str,
    /// Display name of the serving vehicle.
    pub display_name: &'static str,
    /// Slash-separated capability tags the vehicle must provide.
    pub capabilities: &'static str,
}

/// The full catalog. Codes group by vehicle class in the hundreds digit
/// only loosely; the `model` field is authoritative.
pub const ORDER_TYPES: &[OrderTypeInfo] = &[
    OrderTypeInfo { code: 101, model: VehicleModel::Ground, category: "日常百货", display_name: "百货配送车", capabilities: "保温箱" },
    OrderTypeInfo { code: 102, model: VehicleModel::Ground, category: "餐饮", display_name: "餐饮配送车", capabilities: "保温箱" },
    OrderTypeInfo { code: 201, model: VehicleModel::Drone, category: "医药", display_name: "医药无人机", capabilities: "防震/夜视" },
    OrderTypeInfo { code: 301, model: VehicleModel::Ground, category: "快递", display_name: "快递车", capabilities: "防震" },
    OrderTypeInfo { code: 401, model: VehicleModel::Robot, category: "电子产品", display_name: "电子配送机器人", capabilities: "防震/防水" },
    OrderTypeInfo { code: 501, model: VehicleModel::Ground, category: "冷藏", display_name: "冷藏车", capabilities: "保温箱/防水" },
    OrderTypeInfo { code: 601, model: VehicleModel::Drone, category: "文件", display_name: "文件无人机", capabilities: "防震" },
    OrderTypeInfo { code: 701, model: VehicleModel::Ground, category: "鲜花", display_name: "鲜花配送车", capabilities: "保温箱" },
    OrderTypeInfo { code: 801, model: VehicleModel::Robot, category: "服装", display_name: "服装配送机器人", capabilities: "防震" },
    OrderTypeInfo { code: 901, model: VehicleModel::Ground, category: "图书", display_name: "图书配送车", capabilities: "防震" },
];

/// Look up a catalog entry by numeric code.
pub fn order_type(code: i64) -> Option<&'static OrderTypeInfo> {
    ORDER_TYPES.iter().find(|t| t.code == code)
}

/// The comma-joined `order_type` string stored on order rows, e.g.
/// `"四轮车,日常百货,百货配送车,保温箱"`.
pub fn order_type_joined(code: i64) -> Option<String> {
    order_type(code).map(|t| {
        [t.model.label(), t.category, t.display_name, t.capabilities].join(",")
    })
}

/// All catalog codes served by a vehicle class. This is what a freshly
/// generated vehicle advertises as `supported_types`.
pub fn codes_for_model(model: VehicleModel) -> Vec<i64> {
    ORDER_TYPES
        .iter()
        .filter(|t| t.model == model)
        .map(|t| t.code)
        .collect()
}
