// 内置widget类
//
// - @jupyter-widgets/base：WidgetModel、DOMWidgetModel、LayoutModel、StyleModel
// - @jupyter-widgets/controls：链接、容器和几个常用控件
//
// 视图都是不带标记的绑定视图，具体渲染由嵌入环境负责。

pub mod link;

pub use link::LinkModelClass;

use crate::manager::{ClassRegistry, ModuleExports};
use crate::model::BasicModelClass;
use crate::serializers::ModelReferenceSerializer;
use crate::value::WidgetValue;
use crate::view::BoundViewClass;

pub const BASE_MODULE: &str = "@jupyter-widgets/base";
pub const BASE_MODULE_VERSION: &str = "2.0.0";
pub const CONTROLS_MODULE: &str = "@jupyter-widgets/controls";
pub const CONTROLS_MODULE_VERSION: &str = "2.0.0";

fn widget_model() -> BasicModelClass {
    BasicModelClass::new("WidgetModel")
        .with_default("_model_module", BASE_MODULE)
        .with_default("_model_module_version", BASE_MODULE_VERSION)
        .with_default("_view_module", BASE_MODULE)
        .with_default("_view_module_version", BASE_MODULE_VERSION)
        .with_default("_view_name", WidgetValue::Null)
        .with_default("_view_count", WidgetValue::Null)
}

fn dom_widget_model() -> BasicModelClass {
    BasicModelClass::new("DOMWidgetModel")
        .with_default("_view_name", "DOMWidgetView")
        .with_default("_dom_classes", WidgetValue::Array(Vec::new()))
        .with_default("layout", WidgetValue::Null)
        .with_default("tabbable", WidgetValue::Null)
        .with_default("tooltip", WidgetValue::Null)
        .with_serializer("layout", ModelReferenceSerializer)
        .with_serializer("style", ModelReferenceSerializer)
        .extending(&widget_model())
}

fn layout_model() -> BasicModelClass {
    let mut class = BasicModelClass::new("LayoutModel").with_default("_view_name", "LayoutView");
    for key in [
        "align_items",
        "border",
        "display",
        "flex",
        "height",
        "margin",
        "overflow",
        "padding",
        "visibility",
        "width",
    ] {
        class = class.with_default(key, WidgetValue::Null);
    }
    class.extending(&widget_model())
}

fn style_model() -> BasicModelClass {
    BasicModelClass::new("StyleModel")
        .with_default("_view_name", "StyleView")
        .extending(&widget_model())
}

/// controls模块中控件的公共部分
fn control_model(name: &str, view: &str) -> BasicModelClass {
    BasicModelClass::new(name)
        .with_default("_model_module", CONTROLS_MODULE)
        .with_default("_model_module_version", CONTROLS_MODULE_VERSION)
        .with_default("_view_module", CONTROLS_MODULE)
        .with_default("_view_module_version", CONTROLS_MODULE_VERSION)
        .with_default("_view_name", view)
        .with_default("style", WidgetValue::Null)
        .extending(&dom_widget_model())
}

fn box_model(name: &str, view: &str) -> BasicModelClass {
    BasicModelClass::new(name)
        .with_default("children", WidgetValue::Array(Vec::new()))
        .with_default("box_style", "")
        .with_serializer("children", ModelReferenceSerializer)
        .extending(&control_model(name, view))
}

fn int_slider_model() -> BasicModelClass {
    BasicModelClass::new("IntSliderModel")
        .with_default("value", 0)
        .with_default("min", 0)
        .with_default("max", 100)
        .with_default("step", 1)
        .with_default("orientation", "horizontal")
        .with_default("readout", true)
        .with_default("readout_format", "d")
        .with_default("continuous_update", true)
        .with_default("disabled", false)
        .with_default("description", "")
        .extending(&control_model("IntSliderModel", "IntSliderView"))
}

fn button_model() -> BasicModelClass {
    BasicModelClass::new("ButtonModel")
        .with_default("description", "")
        .with_default("disabled", false)
        .with_default("icon", "")
        .with_default("button_style", "")
        .extending(&control_model("ButtonModel", "ButtonView"))
}

fn color_picker_model() -> BasicModelClass {
    BasicModelClass::new("ColorPickerModel")
        .with_default("value", "black")
        .with_default("concise", false)
        .with_default("disabled", false)
        .with_default("description", "")
        .extending(&control_model("ColorPickerModel", "ColorPickerView"))
}

/// base模块的导出表
pub fn base_module() -> ModuleExports {
    ModuleExports::new()
        .with_model(widget_model())
        .with_model(dom_widget_model())
        .with_model(layout_model())
        .with_model(style_model())
        .with_view(BoundViewClass::new("WidgetView"))
        .with_view(BoundViewClass::new("DOMWidgetView"))
        .with_view(BoundViewClass::new("LayoutView"))
        .with_view(BoundViewClass::new("StyleView"))
}

/// controls模块的导出表
pub fn controls_module() -> ModuleExports {
    ModuleExports::new()
        .with_model(LinkModelClass::bidirectional())
        .with_model(LinkModelClass::directional())
        .with_model(box_model("BoxModel", "BoxView"))
        .with_model(box_model("HBoxModel", "HBoxView"))
        .with_model(box_model("VBoxModel", "VBoxView"))
        .with_model(int_slider_model())
        .with_model(button_model())
        .with_model(color_picker_model())
        .with_view(BoundViewClass::new("BoxView"))
        .with_view(BoundViewClass::new("HBoxView"))
        .with_view(BoundViewClass::new("VBoxView"))
        .with_view(BoundViewClass::new("IntSliderView"))
        .with_view(BoundViewClass::new("ButtonView"))
        .with_view(BoundViewClass::new("ColorPickerView"))
}

/// 把内置模块登记到注册表
pub fn register_builtins(registry: &ClassRegistry) {
    registry.register_builtin(BASE_MODULE, base_module());
    registry.register_builtin(CONTROLS_MODULE, controls_module());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ModelClass;

    #[test]
    fn test_builtin_exports() {
        let controls = controls_module();
        for name in ["LinkModel", "DirectionalLinkModel", "HBoxModel", "IntSliderView"] {
            assert!(controls.get(name).is_some(), "missing {}", name);
        }
        assert_eq!(base_module().len(), 8);
    }

    #[test]
    fn test_slider_defaults_carry_view_and_references() {
        let slider = int_slider_model();
        let defaults = slider.defaults();
        assert_eq!(defaults["_view_name"].as_str(), Some("IntSliderView"));
        assert_eq!(defaults["_view_module"].as_str(), Some(CONTROLS_MODULE));
        assert_eq!(defaults["max"].as_i64(), Some(100));
        assert!(slider.serializers().contains("layout"));
        assert!(slider.serializers().contains("style"));
    }
}
