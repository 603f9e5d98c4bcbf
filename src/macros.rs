//! Macro for declaring workflow programs.

/// Define a workflow program entry point.
///
/// ```ignore
/// workflow! {
///     Provision<ProvisionContext, ProvisionError> {
///         login: Login,
///         create_application: CreateApplication,
///     }
/// }
/// ```
///
/// # Generated Code
///
/// The macro generates:
/// - `{Name}Inputs` struct with fields for each step's input
/// - `{Name}` struct with `new()` and `build()` methods
/// - `{Name}::STEPS`, the declared step names in order
/// - `{Name}Steps` type alias for the underlying HList
#[macro_export]
macro_rules! workflow {
    (
        $name:ident <$ctx:ty, $err:ty> {
            $(
                $step_name:ident : $step_type:ty
            ),+
            $(,)?
        }
    ) => {
        $crate::paste::paste! {
            /// Input struct for the program, one field per step.
            #[allow(missing_docs)]
            #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
            pub struct [<$name Inputs>] {
                $(
                    pub $step_name: <$step_type as $crate::Step<$ctx, $err>>::Input,
                )+
            }

            /// The program struct.
            #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
            pub struct $name {
                inputs: [<$name Inputs>],
            }

            impl $name {
                /// Declared step names, in execution order.
                pub const STEPS: &'static [&'static str] = &[$(stringify!($step_name)),+];

                /// Create a new program with the given inputs.
                pub fn new(inputs: [<$name Inputs>]) -> Self {
                    Self { inputs }
                }

                /// The inputs this program was created with.
                pub fn inputs(&self) -> &[<$name Inputs>] {
                    &self.inputs
                }

                /// Build an execution from this program.
                pub fn build(self, ctx: $ctx) -> $crate::Execution<
                    $ctx,
                    $err,
                    $crate::workflow!(@steps_type $ctx, $err, [$($step_name: $step_type),+]),
                    $crate::New
                >
                where
                    $ctx: Send + Sync + 'static,
                    $err: Send + Sync + std::fmt::Display + 'static,
                {
                    let steps = $crate::workflow!(@build_steps self.inputs, $ctx, $err, [$($step_name: $step_type),+]);
                    $crate::Execution::new(steps, ctx)
                }
            }

            /// Type alias for the steps HList type.
            #[allow(dead_code)]
            pub type [<$name Steps>] = $crate::workflow!(@steps_type $ctx, $err, [$($step_name: $step_type),+]);
        }
    };

    // Generate the HList type for steps
    (@steps_type $ctx:ty, $err:ty, [$only_name:ident: $only_type:ty]) => {
        $crate::HSingle<$crate::StepWrapper<$only_type, $ctx, $err>>
    };

    (@steps_type $ctx:ty, $err:ty, [$first_name:ident: $first_type:ty, $($rest_name:ident: $rest_type:ty),+]) => {
        $crate::HCons<
            $crate::StepWrapper<$first_type, $ctx, $err>,
            $crate::workflow!(@steps_type $ctx, $err, [$($rest_name: $rest_type),+])
        >
    };

    // Build the HList of steps
    (@build_steps $inputs:expr, $ctx:ty, $err:ty, [$only_name:ident: $only_type:ty]) => {
        $crate::HSingle::new($crate::StepWrapper::<$only_type, $ctx, $err>::new(
            stringify!($only_name),
            $inputs.$only_name.clone(),
        ))
    };

    (@build_steps $inputs:expr, $ctx:ty, $err:ty, [$first_name:ident: $first_type:ty, $($rest_name:ident: $rest_type:ty),+]) => {
        $crate::HCons::new(
            $crate::StepWrapper::<$first_type, $ctx, $err>::new(
                stringify!($first_name),
                $inputs.$first_name.clone(),
            ),
            $crate::workflow!(@build_steps $inputs, $ctx, $err, [$($rest_name: $rest_type),+])
        )
    };
}
